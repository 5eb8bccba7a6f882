//! Finds which template governs a given node, following the standard
//! conflict-resolution order: highest import precedence wins, then highest
//! priority, then latest declaration order; ties are a recoverable error.
use crate::ast::{CompiledStylesheet, Template};
use crate::error::{ErrorHandlingMode, RecoverableKind, XsltError};
use crate::tree::Node;

pub enum MatchOutcome<'t> {
    Template(&'t Template),
    BuiltIn,
}

/// Selects the template that applies to `node` in `mode`, implementing the
/// processing-model's built-in-template fallback when nothing matches:
/// elements and the root recurse into children, text and attribute nodes
/// copy their string value, comments and processing instructions produce
/// nothing.
pub fn find_template<'t>(
    sheet: &'t CompiledStylesheet,
    node: Node<'_>,
    mode: Option<&str>,
    error_mode: ErrorHandlingMode,
) -> Result<MatchOutcome<'t>, XsltError> {
    let root = node.document().root();
    let mut candidates: Vec<&Template> = sheet
        .templates
        .iter()
        .filter(|t| t.name.is_none() || t.pattern.is_some())
        .filter(|t| t.mode.as_deref() == mode)
        .filter(|t| {
            t.pattern
                .as_ref()
                .is_some_and(|p| p.matches(node, root))
        })
        .collect();

    if candidates.is_empty() {
        return Ok(MatchOutcome::BuiltIn);
    }

    let max_precedence = candidates.iter().map(|t| t.import_precedence).max().unwrap();
    candidates.retain(|t| t.import_precedence == max_precedence);

    let max_priority = candidates
        .iter()
        .map(|t| t.priority)
        .fold(f64::NEG_INFINITY, f64::max);
    candidates.retain(|t| (t.priority - max_priority).abs() < f64::EPSILON);

    if candidates.len() > 1 {
        candidates.sort_by_key(|t| t.decl_order);
        let winner = candidates.last().copied().unwrap();
        if error_mode == ErrorHandlingMode::Strict {
            return Err(XsltError::Recoverable {
                kind: RecoverableKind::MultipleTemplateMatches,
                message: format!(
                    "{} templates match the same node at priority {} in mode {:?}; using the last declared",
                    candidates.len(),
                    max_priority,
                    mode
                ),
            });
        }
        if error_mode == ErrorHandlingMode::Recover {
            log::warn!(
                "{} templates match the same node at priority {}; using the last declared",
                candidates.len(),
                max_priority
            );
        }
        return Ok(MatchOutcome::Template(winner));
    }

    Ok(MatchOutcome::Template(candidates[0]))
}

/// Re-dispatches for `xsl:apply-imports`: like [`find_template`] but
/// restricted to templates of strictly lower import precedence than
/// `current` — the templates `current`'s own stylesheet module imported.
pub fn find_template_apply_imports<'t>(
    sheet: &'t CompiledStylesheet,
    node: Node<'_>,
    mode: Option<&str>,
    current: &Template,
    error_mode: ErrorHandlingMode,
) -> Result<MatchOutcome<'t>, XsltError> {
    find_template_below(sheet, node, mode, current, error_mode, |t| {
        t.import_precedence < current.import_precedence
    })
}

/// Re-dispatches for `xsl:next-match`: like [`find_template`] but considers
/// only templates that rank strictly below `current` in the same
/// precedence/priority/declaration-order total order the matcher itself
/// uses — i.e. the rule that would have won had `current` not existed.
pub fn find_template_next_match<'t>(
    sheet: &'t CompiledStylesheet,
    node: Node<'_>,
    mode: Option<&str>,
    current: &Template,
    error_mode: ErrorHandlingMode,
) -> Result<MatchOutcome<'t>, XsltError> {
    let current_rank = (current.import_precedence, ordered_priority(current.priority), current.decl_order);
    find_template_below(sheet, node, mode, current, error_mode, |t| {
        (t.import_precedence, ordered_priority(t.priority), t.decl_order) < current_rank
    })
}

/// `f64` total order for tuple comparison: priorities never compare as NaN
/// in practice (parsed from `@priority` or the fixed default-priority tiers),
/// so this just needs the normal-number ordering `f64` doesn't implement.
fn ordered_priority(p: f64) -> i64 {
    (p * 1000.0).round() as i64
}

fn find_template_below<'t>(
    sheet: &'t CompiledStylesheet,
    node: Node<'_>,
    mode: Option<&str>,
    current: &Template,
    error_mode: ErrorHandlingMode,
    keep: impl Fn(&Template) -> bool,
) -> Result<MatchOutcome<'t>, XsltError> {
    let root = node.document().root();
    let mut candidates: Vec<&Template> = sheet
        .templates
        .iter()
        .filter(|t| t.name.is_none() || t.pattern.is_some())
        .filter(|t| t.mode.as_deref() == mode)
        .filter(|t| !std::ptr::eq(*t, current))
        .filter(|t| keep(t))
        .filter(|t| t.pattern.as_ref().is_some_and(|p| p.matches(node, root)))
        .collect();

    if candidates.is_empty() {
        return Ok(MatchOutcome::BuiltIn);
    }

    let max_precedence = candidates.iter().map(|t| t.import_precedence).max().unwrap();
    candidates.retain(|t| t.import_precedence == max_precedence);
    let max_priority = candidates.iter().map(|t| t.priority).fold(f64::NEG_INFINITY, f64::max);
    candidates.retain(|t| (t.priority - max_priority).abs() < f64::EPSILON);

    candidates.sort_by_key(|t| t.decl_order);
    let winner = candidates.last().copied().unwrap();
    if candidates.len() > 1 && error_mode == ErrorHandlingMode::Strict {
        return Err(XsltError::Recoverable {
            kind: RecoverableKind::MultipleTemplateMatches,
            message: "multiple templates match in apply-imports/next-match re-dispatch".to_string(),
        });
    }
    Ok(MatchOutcome::Template(winner))
}

/// Looks up a named template, honoring import precedence among templates
/// sharing a name (only possible via `xsl:include`/`xsl:import` merges).
pub fn find_named_template<'t>(
    sheet: &'t CompiledStylesheet,
    name: &str,
) -> Option<&'t Template> {
    sheet
        .templates
        .iter()
        .filter(|t| t.name.as_deref() == Some(name))
        .max_by(|a, b| {
            a.import_precedence
                .cmp(&b.import_precedence)
                .then(a.decl_order.cmp(&b.decl_order))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Template;
    use crate::pattern;
    use crate::xml_events::parse_document;

    fn template(pattern_src: &str, priority: f64, decl_order: u32) -> Template {
        Template {
            name: None,
            mode: None,
            pattern: Some(pattern::parse(pattern_src).unwrap()),
            priority,
            import_precedence: 0,
            decl_order,
            params: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn picks_highest_priority() {
        let doc = parse_document("<root><para/></root>").unwrap();
        let para = doc.root().children().next().unwrap().children().next().unwrap();
        let sheet = CompiledStylesheet {
            templates: vec![template("*", -0.25, 0), template("para", 0.0, 1)],
            ..Default::default()
        };
        match find_template(&sheet, para, None, ErrorHandlingMode::Recover).unwrap() {
            MatchOutcome::Template(t) => assert_eq!(t.decl_order, 1),
            MatchOutcome::BuiltIn => panic!("expected a template match"),
        }
    }

    #[test]
    fn falls_back_to_built_in_rule() {
        let doc = parse_document("<root><para/></root>").unwrap();
        let para = doc.root().children().next().unwrap().children().next().unwrap();
        let sheet = CompiledStylesheet::default();
        assert!(matches!(
            find_template(&sheet, para, None, ErrorHandlingMode::Recover).unwrap(),
            MatchOutcome::BuiltIn
        ));
    }

    #[test]
    fn tie_breaks_on_declaration_order() {
        let doc = parse_document("<root><para/></root>").unwrap();
        let para = doc.root().children().next().unwrap().children().next().unwrap();
        let sheet = CompiledStylesheet {
            templates: vec![template("para", 0.0, 0), template("para", 0.0, 5)],
            ..Default::default()
        };
        match find_template(&sheet, para, None, ErrorHandlingMode::Recover).unwrap() {
            MatchOutcome::Template(t) => assert_eq!(t.decl_order, 5),
            MatchOutcome::BuiltIn => panic!("expected a template match"),
        }
    }
}
