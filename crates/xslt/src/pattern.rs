//! A dedicated engine for parsing and evaluating XSLT `match` patterns.
use std::fmt;

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::map;
use nom::multi::{many0, separated_list1};
use nom::sequence::preceded;
use xsltransform_xpath::ast::{Expression, NodeTest, NodeTypeTest};
use xsltransform_xpath::datasource::{DataSourceNode, NodeType};
use xsltransform_xpath::functions::FunctionRegistry;
use xsltransform_xpath::parser as xpath_parser;
use xsltransform_xpath::{EvaluationContext, XPathValue, evaluate};

use crate::error::XsltError;

/// Represents a single location step in a match pattern (e.g., `foo`, `*`, `text()`).
/// `predicates` holds bracketed filters (`item[@id='x']`), evaluated with the
/// candidate node bound as the context node and position/size computed
/// against its axis siblings at match time.
#[derive(Debug, Clone)]
struct MatchStep {
    axis: MatchAxis,
    node_test: NodeTest,
    predicates: Vec<Expression>,
    /// True when this step followed a `//` in the source pattern: the step
    /// below it in the path may be any ancestor, not just the immediate parent.
    preceded_by_descendant: bool,
}

impl PartialEq for MatchStep {
    fn eq(&self, other: &Self) -> bool {
        // Expression has no PartialEq; patterns are compared only in tests,
        // where identical source text is what matters.
        self.axis == other.axis && self.node_test == other.node_test
    }
}
impl Eq for MatchStep {}

/// The axes relevant for match patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchAxis {
    Child,
    Attribute,
}

/// A compiled representation of an XSLT match pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// A pattern can be a union of multiple paths, e.g., "para|note".
    paths: Vec<LocationPathPattern>,
    original_text: String,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original_text)
    }
}

/// A single location path within a pattern, e.g., "/doc/section/para".
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocationPathPattern {
    is_absolute: bool,
    steps: Vec<MatchStep>,
}

impl Pattern {
    /// Evaluates if a given node matches this compiled pattern.
    pub fn matches<'a, N: DataSourceNode<'a>>(&self, node: N, root: N) -> bool {
        self.paths.iter().any(|path| path.matches(node, root))
    }

    pub fn original_text(&self) -> &str {
        &self.original_text
    }

    /// The default priority XSLT assigns a pattern with no explicit
    /// `priority` attribute: 0 for a single step with a literal QName test,
    /// -0.25 for a single step naming a namespace-qualified wildcard
    /// (`prefix:*` or `@prefix:*`), -0.5 for a single step with a bare
    /// `*`/`@*` or a node-type test (`node()`, `text()`, …), and 0.5 for
    /// anything more general (a multi-step path, or a single step carrying
    /// one or more predicates). A union pattern takes the maximum across its
    /// alternatives, mirroring how `xsl:template` with a `|`-separated match
    /// behaves as independent pattern/priority pairs sharing one body.
    pub fn default_priority(&self) -> f64 {
        self.paths
            .iter()
            .map(LocationPathPattern::default_priority)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

impl LocationPathPattern {
    fn matches<'a, N: DataSourceNode<'a>>(&self, node: N, root: N) -> bool {
        if self.steps.is_empty() {
            // Special case for "/"
            return self.is_absolute && node == root;
        }
        self.match_step(self.steps.len() - 1, node, root)
    }

    /// True if `node` satisfies `steps[idx]` and the earlier steps match a
    /// valid ancestor chain above it, anchored at `root` for an absolute
    /// pattern. A `//`-introduced step may skip any number of ancestors
    /// (tried nearest-first, backtracking on failure) instead of requiring
    /// an exact parent.
    fn match_step<'a, N: DataSourceNode<'a>>(&self, idx: usize, node: N, root: N) -> bool {
        if !self.steps[idx].matches(node, root) {
            return false;
        }
        if idx == 0 {
            return if self.is_absolute {
                node.parent() == Some(root)
            } else {
                true
            };
        }
        if self.steps[idx].preceded_by_descendant {
            let mut cursor = node.parent();
            while let Some(ancestor) = cursor {
                if self.match_step(idx - 1, ancestor, root) {
                    return true;
                }
                cursor = ancestor.parent();
            }
            false
        } else {
            match node.parent() {
                Some(parent) => self.match_step(idx - 1, parent, root),
                None => false,
            }
        }
    }

    fn default_priority(&self) -> f64 {
        if self.steps.len() != 1 || !self.steps[0].predicates.is_empty() {
            return 0.5;
        }
        match &self.steps[0].node_test {
            NodeTest::Name(_) => 0.0,
            NodeTest::NamespaceWildcard(_) => -0.25,
            NodeTest::Wildcard => -0.5,
            NodeTest::NodeType(_) => -0.5,
        }
    }
}

impl MatchStep {
    fn matches<'a, N: DataSourceNode<'a>>(&self, node: N, root: N) -> bool {
        if !self.test_matches(node) {
            return false;
        }
        if self.predicates.is_empty() {
            return true;
        }
        let (position, size) = self.axis_position(node);
        let functions = FunctionRegistry::default();
        let empty_vars = std::collections::HashMap::new();
        let empty_keys = std::collections::HashMap::new();
        self.predicates.iter().all(|pred| {
            let ctx = EvaluationContext::new(
                node,
                root,
                &functions,
                position,
                size,
                &empty_vars,
                &empty_keys,
                false,
            );
            match evaluate(pred, &ctx) {
                Ok(XPathValue::Number(n)) => n.round() as usize == position,
                Ok(v) => v.to_bool(),
                Err(_) => false,
            }
        })
    }

    /// The (position, size) pair a predicate sees, computed over the node's
    /// axis siblings matched by this step's own node test (not predicates) —
    /// the same set the step's underlying axis would enumerate at match time.
    fn axis_position<'a, N: DataSourceNode<'a>>(&self, node: N) -> (usize, usize) {
        let Some(parent) = node.parent() else {
            return (1, 1);
        };
        let siblings: Vec<N> = match self.axis {
            MatchAxis::Attribute => parent.attributes().filter(|n| self.test_matches(*n)).collect(),
            MatchAxis::Child => parent.children().filter(|n| self.test_matches(*n)).collect(),
        };
        let size = siblings.len().max(1);
        let position = siblings.iter().position(|n| *n == node).map(|i| i + 1).unwrap_or(1);
        (position, size)
    }

    fn test_matches<'a, N: DataSourceNode<'a>>(&self, node: N) -> bool {
        let node_type = node.node_type();
        let name = node.name();

        match self.axis {
            MatchAxis::Attribute => {
                if node_type != NodeType::Attribute {
                    return false;
                }
            }
            MatchAxis::Child => {
                // Child axis in patterns can match elements, text nodes, and the root.
                if node_type != NodeType::Element
                    && node_type != NodeType::Text
                    && node_type != NodeType::Root
                {
                    return false;
                }
            }
        }

        match &self.node_test {
            NodeTest::Wildcard => {
                // `*` on a child axis should only match elements.
                if self.axis == MatchAxis::Child {
                    node_type == NodeType::Element
                } else {
                    true
                }
            }
            NodeTest::NamespaceWildcard(prefix) => name.is_some_and(|q| {
                node_type == NodeType::Element && q.prefix == Some(prefix.as_str())
            }),
            NodeTest::Name(test_name) => name.is_some_and(|q| match q.prefix {
                Some(p) if !p.is_empty() => {
                    let mut qualified = String::with_capacity(p.len() + 1 + q.local_part.len());
                    qualified.push_str(p);
                    qualified.push(':');
                    qualified.push_str(q.local_part);
                    &qualified == test_name
                }
                _ => q.local_part == test_name,
            }),
            NodeTest::NodeType(ntt) => match ntt {
                NodeTypeTest::Text => node_type == NodeType::Text,
                NodeTypeTest::Comment => node_type == NodeType::Comment,
                NodeTypeTest::ProcessingInstruction => node_type == NodeType::ProcessingInstruction,
                NodeTypeTest::Node => true,
            },
        }
    }
}

// --- Parser ---

pub fn parse(text: &str) -> Result<Pattern, XsltError> {
    match pattern_parser(text.trim()) {
        Ok(("", paths)) => Ok(Pattern {
            paths,
            original_text: text.to_string(),
        }),
        Ok((rem, _)) => Err(XsltError::Compilation(format!(
            "unconsumed input in pattern '{}': {}",
            text, rem
        ))),
        Err(e) => Err(XsltError::Compilation(format!(
            "invalid pattern '{}': {}",
            text, e
        ))),
    }
}

/// Parses a bracketed predicate (`[expr]`) by bracket-balance scanning (a
/// predicate's inner expression may itself contain a nested `[...]` step),
/// then handing the inner text to the full XPath expression parser.
fn predicate(input: &str) -> IResult<&str, Expression> {
    use nom::error::{Error, ErrorKind};
    if !input.starts_with('[') {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Char)));
    }
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end.ok_or_else(|| nom::Err::Error(Error::new(input, ErrorKind::Char)))?;
    let inner = &input[1..end];
    let expr = xpath_parser::parse_expression(inner)
        .map_err(|_| nom::Err::Error(Error::new(input, ErrorKind::Verify)))?;
    Ok((&input[end + 1..], expr))
}

fn step_parser(input: &str) -> IResult<&str, MatchStep> {
    let (remaining_input, (node_test, axis)) = alt((
        map(preceded(tag("@"), xpath_parser::node_test), |nt| {
            (nt, MatchAxis::Attribute)
        }),
        map(xpath_parser::node_test, |nt| (nt, MatchAxis::Child)),
    ))(input)?;
    let (remaining_input, predicates) = many0(predicate)(remaining_input)?;

    Ok((
        remaining_input,
        MatchStep {
            axis,
            node_test,
            predicates,
            preceded_by_descendant: false,
        },
    ))
}

/// Parses one `/`- or `//`-separated location path. `//` is handled as a
/// gap marker on the step that follows it (see [`MatchStep::preceded_by_descendant`])
/// rather than by expanding to a literal `descendant-or-self::node()` step,
/// since patterns only ever walk upward via `parent()`.
fn path_parser(input: &str) -> IResult<&str, LocationPathPattern> {
    let mut is_absolute = false;
    let mut steps: Vec<MatchStep> = Vec::new();
    let mut remaining = input;
    let mut pending_descendant_gap = false;

    if let Some(rest) = remaining.strip_prefix("//") {
        is_absolute = true;
        pending_descendant_gap = true;
        remaining = rest;
    } else if let Some(rest) = remaining.strip_prefix('/') {
        is_absolute = true;
        remaining = rest;
        if remaining.is_empty() || remaining.starts_with('|') {
            return Ok((remaining, LocationPathPattern { is_absolute, steps }));
        }
    }

    loop {
        let (rem, mut step) = step_parser(remaining)?;
        step.preceded_by_descendant = pending_descendant_gap;
        steps.push(step);
        remaining = rem;
        if let Some(rest) = remaining.strip_prefix("//") {
            pending_descendant_gap = true;
            remaining = rest;
        } else if let Some(rest) = remaining.strip_prefix('/') {
            pending_descendant_gap = false;
            remaining = rest;
        } else {
            break;
        }
    }

    Ok((remaining, LocationPathPattern { is_absolute, steps }))
}

fn pattern_parser(input: &str) -> IResult<&str, Vec<LocationPathPattern>> {
    separated_list1(tag("|"), path_parser)(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsltransform_xpath::datasource::tests::{MockNode, MockTree, create_test_tree};

    fn get_node<'a>(tree: &'a MockTree<'a>, id: usize) -> MockNode<'a> {
        MockNode { id, tree }
    }

    #[test]
    fn test_pattern_parsing() {
        assert!(parse("foo").is_ok());
        assert!(parse("foo/bar").is_ok());
        assert!(parse("/").is_ok());
        assert!(parse("/*").is_ok());
        assert!(parse("/root/item").is_ok());
        assert!(parse("foo|bar").is_ok());
        assert!(parse("text()").is_ok());
        assert!(parse("@id").is_ok());
        assert!(parse("*").is_ok());
        assert!(parse("foo/*/@id").is_ok());
    }

    #[test]
    fn test_simple_name_match() {
        let tree = create_test_tree();
        let pattern = parse("para").unwrap();
        assert!(pattern.matches(get_node(&tree, 1), get_node(&tree, 0))); // <para>
        assert!(!pattern.matches(get_node(&tree, 0), get_node(&tree, 0))); // <root>
    }

    #[test]
    fn test_absolute_wildcard_match() {
        let tree = create_test_tree();
        let pattern = parse("/*").unwrap();
        let root_node = get_node(&tree, 0);
        let doc_element = get_node(&tree, 1); // <para> is the document element in the test tree
        let text_node = get_node(&tree, 4);

        assert!(pattern.matches(doc_element, root_node));
        assert!(!pattern.matches(root_node, root_node));
        assert!(!pattern.matches(text_node, root_node));
    }

    #[test]
    fn test_path_match() {
        let tree = create_test_tree();
        let pattern = parse("para/text()").unwrap();
        assert!(pattern.matches(get_node(&tree, 4), get_node(&tree, 0))); // "Hello" text node
        assert!(!pattern.matches(get_node(&tree, 1), get_node(&tree, 0))); // <para> itself
    }

    #[test]
    fn test_absolute_path_match() {
        let tree = create_test_tree();
        let root_pattern = parse("/").unwrap();
        assert!(root_pattern.matches(get_node(&tree, 0), get_node(&tree, 0)));
        assert!(!root_pattern.matches(get_node(&tree, 1), get_node(&tree, 0)));
    }

    #[test]
    fn test_union_match() {
        let tree = create_test_tree();
        let pattern = parse("nonexistent|para").unwrap();
        assert!(pattern.matches(get_node(&tree, 1), get_node(&tree, 0)));
    }

    #[test]
    fn test_attribute_match() {
        let tree = create_test_tree();
        let pattern = parse("@id").unwrap();
        assert!(pattern.matches(get_node(&tree, 2), get_node(&tree, 0))); // id attribute
        assert!(!pattern.matches(get_node(&tree, 1), get_node(&tree, 0))); // <para> element
    }

    #[test]
    fn test_predicate_filters_candidates() {
        let tree = create_test_tree();
        let pattern = parse("para[@id]").unwrap();
        assert!(pattern.matches(get_node(&tree, 1), get_node(&tree, 0))); // <para id="p1">
        assert!(!pattern.matches(get_node(&tree, 6), get_node(&tree, 0))); // <para> without @id
    }

    #[test]
    fn test_descendant_separator_skips_ancestors() {
        let tree = create_test_tree();
        let pattern = parse("//para").unwrap();
        assert!(pattern.matches(get_node(&tree, 1), get_node(&tree, 0)));
        assert!(pattern.matches(get_node(&tree, 6), get_node(&tree, 0)));
        assert!(!pattern.matches(get_node(&tree, 5), get_node(&tree, 0))); // <div>
    }

    #[test]
    fn test_default_priority() {
        assert_eq!(parse("para").unwrap().default_priority(), 0.0);
        assert_eq!(parse("*").unwrap().default_priority(), -0.5);
        assert_eq!(parse("text()").unwrap().default_priority(), -0.5);
        assert_eq!(parse("para/note").unwrap().default_priority(), 0.5);
        assert_eq!(parse("para[@id]").unwrap().default_priority(), 0.5);
    }
}
