//! Compiles stylesheet source text into a [`CompiledStylesheet`].
//!
//! Follows the same shape as this codebase's node-tree builder and the rest
//! of its parsers: a `quick_xml`-driven event loop feeding a state-stack
//! builder, one `handle_*_start`/`handle_*_end` pair per XSLT element, each
//! pushing a [`BuilderState`] and popping a completed AST node onto its
//! parent's instruction list.
use std::collections::HashMap;

use log::warn;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use xsltransform_xpath::parser::parse_expression;

use crate::ast::{
    Avt, AvtPart, AttributeSetDef, CharacterMap, CompiledStylesheet, DecimalFormat, GlobalBinding,
    Instruction, KeyDef, LiteralAttr, NumberInstr, NumberLevel, OutputMethod, OutputProperties,
    Param, SortKey, SpacePattern, Template, WithParam, XPathExpr,
};
use crate::error::{Location, XsltError};
use crate::pattern::{self, Pattern};

const XSL_NS: &str = "http://www.w3.org/1999/XSL/Transform";

/// Resolves the document referenced by an `xsl:include`/`xsl:import` `href`.
/// Left to the caller since href resolution (filesystem, embedded resource
/// table, network) is an application concern, not a compiler one.
pub trait StylesheetLoader {
    fn load(&self, href: &str) -> Result<String, XsltError>;
}

/// A loader that refuses every include/import; suitable for stylesheets
/// known not to use either.
pub struct NullLoader;

impl StylesheetLoader for NullLoader {
    fn load(&self, href: &str) -> Result<String, XsltError> {
        Err(XsltError::Compilation(format!(
            "xsl:include/xsl:import of '{href}' requires a StylesheetLoader"
        )))
    }
}

type OwnedAttrs = Vec<(Option<String>, String, String)>;

#[derive(Debug)]
enum BuilderState {
    Stylesheet,
    Template {
        match_pattern: Option<Pattern>,
        name: Option<String>,
        mode: Option<String>,
        priority: Option<f64>,
        params: Vec<Param>,
    },
    If {
        test: XPathExpr,
    },
    Choose {
        whens: Vec<(XPathExpr, Vec<Instruction>)>,
        otherwise: Option<Vec<Instruction>>,
    },
    When {
        test: XPathExpr,
    },
    Otherwise,
    ForEach {
        select: XPathExpr,
        sorts: Vec<SortKey>,
    },
    ApplyTemplates {
        select: Option<XPathExpr>,
        mode: Option<String>,
        sorts: Vec<SortKey>,
        with_params: Vec<WithParam>,
    },
    CallTemplate {
        name: String,
        with_params: Vec<WithParam>,
    },
    ApplyImports {
        with_params: Vec<WithParam>,
    },
    NextMatch {
        with_params: Vec<WithParam>,
    },
    Variable {
        name: String,
        select: Option<XPathExpr>,
        is_param: bool,
    },
    AttributeSet {
        name: String,
        uses: Vec<String>,
    },
    Attribute {
        name: Avt,
        namespace: Option<Avt>,
    },
    ElementInstr {
        name: Avt,
        namespace: Option<Avt>,
        use_attribute_sets: Vec<String>,
    },
    Copy {
        use_attribute_sets: Vec<String>,
    },
    Text {
        disable_output_escaping: bool,
    },
    Comment,
    Pi {
        name: Avt,
    },
    Namespace {
        name: Avt,
        select: Option<XPathExpr>,
    },
    Message {
        terminate: bool,
    },
    Key {
        name: String,
        match_pattern: Pattern,
        use_expr: XPathExpr,
    },
    DecimalFormatDecl {
        name: String,
        fmt: DecimalFormat,
    },
    CharacterMapDecl {
        name: String,
        map: CharacterMap,
    },
    LiteralElement {
        prefix: Option<String>,
        local_name: String,
        namespace_decls: Vec<(Option<String>, String)>,
        attributes: Vec<LiteralAttr>,
        use_attribute_sets: Vec<String>,
    },
    /// Structural-only containers whose children are collected for the
    /// parent to consume directly (`xsl:stylesheet`/`xsl:transform` root).
    Ignored,
}

pub struct CompilerBuilder<'a> {
    loader: &'a dyn StylesheetLoader,
    state_stack: Vec<BuilderState>,
    instruction_stack: Vec<Vec<Instruction>>,
    /// Prefix -> URI, tracked as a stack of scopes pushed/popped alongside
    /// elements so `resolve_prefix` sees only namespaces in scope.
    ns_scopes: Vec<Vec<(Option<String>, String)>>,
    sheet: CompiledStylesheet,
    next_decl_order: u32,
    import_precedence: u32,
    source: String,
}

pub fn compile(source: &str, loader: &dyn StylesheetLoader) -> Result<CompiledStylesheet, XsltError> {
    let mut builder = CompilerBuilder::new(loader, source);
    builder.run()?;
    Ok(builder.sheet)
}

impl<'a> CompilerBuilder<'a> {
    fn new(loader: &'a dyn StylesheetLoader, source: &str) -> Self {
        CompilerBuilder {
            loader,
            state_stack: Vec::new(),
            instruction_stack: vec![Vec::new()],
            ns_scopes: vec![vec![(Some("xsl".to_string()), XSL_NS.to_string())]],
            sheet: CompiledStylesheet::default(),
            next_decl_order: 0,
            import_precedence: 0,
            source: source.to_string(),
        }
    }

    fn location_at(&self, pos: usize) -> Location {
        let prefix = &self.source.as_bytes()[..pos.min(self.source.len())];
        let line = prefix.iter().filter(|&&b| b == b'\n').count() + 1;
        let col = match prefix.iter().rposition(|&b| b == b'\n') {
            Some(idx) => pos - idx,
            None => pos + 1,
        };
        Location { line, col }
    }

    fn run(&mut self) -> Result<(), XsltError> {
        let source = self.source.clone();
        let mut reader = Reader::from_str(&source);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        loop {
            let pos = reader.buffer_position() as usize;
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => self.start_element(&e, pos, false)?,
                Event::Empty(e) => self.start_element(&e, pos, true)?,
                Event::End(_) => self.end_element(pos)?,
                Event::Text(e) => {
                    let raw = e.unescape().map_err(XsltError::from)?;
                    self.push_text(raw.as_ref(), false);
                }
                Event::CData(e) => {
                    let text = std::str::from_utf8(e.as_ref())?;
                    self.push_text(text, false);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(())
    }

    fn push_instr(&mut self, instr: Instruction) {
        if let Some(list) = self.instruction_stack.last_mut() {
            list.push(instr);
        }
    }

    fn push_text(&mut self, text: &str, disable_escaping: bool) {
        if text.is_empty() {
            return;
        }
        if disable_escaping {
            self.push_instr(Instruction::Text {
                disable_output_escaping: true,
                content: text.to_string(),
            });
        } else {
            self.push_instr(Instruction::LiteralText(text.to_string()));
        }
    }

    fn resolve_prefix(&self, prefix: Option<&str>) -> Option<String> {
        for scope in self.ns_scopes.iter().rev() {
            for (p, uri) in scope.iter().rev() {
                if p.as_deref() == prefix {
                    return Some(uri.clone());
                }
            }
        }
        None
    }

    fn split_attrs(&self, e: &BytesStart) -> Result<(Vec<(Option<String>, String)>, OwnedAttrs), XsltError> {
        let mut ns_decls = Vec::new();
        let mut attrs = Vec::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr.unescape_value()?.into_owned();
            if key == "xmlns" {
                ns_decls.push((None, value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                ns_decls.push((Some(prefix.to_string()), value));
            } else {
                let (prefix, local) = split_qname(&key);
                attrs.push((prefix, local, value));
            }
        }
        Ok((ns_decls, attrs))
    }

    fn start_element(&mut self, e: &BytesStart, pos: usize, empty: bool) -> Result<(), XsltError> {
        let (ns_decls, attrs) = self.split_attrs(e)?;
        self.ns_scopes.push(ns_decls);
        let raw_name = std::str::from_utf8(e.name().as_ref())?.to_string();
        let (prefix, local) = split_qname(&raw_name);
        let is_xsl = prefix.as_deref() == Some("xsl") || self.resolve_prefix(prefix.as_deref()).as_deref() == Some(XSL_NS);

        self.instruction_stack.push(Vec::new());

        if is_xsl {
            self.dispatch_xsl_start(&local, &attrs, pos)?;
        } else {
            let attributes = attrs
                .iter()
                .map(|(p, n, v)| {
                    Ok(LiteralAttr {
                        prefix: p.clone(),
                        local_name: n.clone(),
                        value: parse_avt(v)?,
                    })
                })
                .collect::<Result<Vec<_>, XsltError>>()?;
            let namespace_decls = self
                .ns_scopes
                .last()
                .cloned()
                .unwrap_or_default();
            self.state_stack.push(BuilderState::LiteralElement {
                prefix,
                local_name: local,
                namespace_decls,
                attributes,
                use_attribute_sets: Vec::new(),
            });
        }

        if empty {
            self.end_element(pos)?;
        }
        Ok(())
    }

    fn end_element(&mut self, pos: usize) -> Result<(), XsltError> {
        let body = self.instruction_stack.pop().unwrap_or_default();
        self.ns_scopes.pop();
        let state = self.state_stack.pop();
        self.finish_state(state, body, pos)
    }

    fn finish_state(
        &mut self,
        state: Option<BuilderState>,
        body: Vec<Instruction>,
        pos: usize,
    ) -> Result<(), XsltError> {
        let loc = self.location_at(pos);
        match state {
            None | Some(BuilderState::Stylesheet) | Some(BuilderState::Ignored) => {
                for instr in body {
                    self.push_instr(instr);
                }
            }
            Some(BuilderState::Template {
                match_pattern,
                name,
                mode,
                priority,
                params,
            }) => {
                let priority = priority.unwrap_or_else(|| {
                    match_pattern.as_ref().map(Pattern::default_priority).unwrap_or(0.5)
                });
                let decl_order = self.next_decl_order;
                self.next_decl_order += 1;
                let template = Template {
                    name: name.clone(),
                    mode,
                    pattern: match_pattern,
                    priority,
                    import_precedence: self.import_precedence,
                    decl_order,
                    params,
                    body,
                };
                if let Some(name) = &name {
                    self.sheet.named_templates.insert(name.clone(), self.sheet.templates.len());
                }
                self.sheet.templates.push(template);
            }
            Some(BuilderState::If { test }) => self.push_instr(Instruction::If { test, body }),
            Some(BuilderState::Choose { mut whens, otherwise }) => {
                if whens.is_empty() && otherwise.is_none() {
                    return Err(XsltError::Structure {
                        message: "xsl:choose requires at least one xsl:when".to_string(),
                        location: loc,
                    });
                }
                whens.shrink_to_fit();
                self.push_instr(Instruction::Choose { whens, otherwise });
            }
            Some(BuilderState::When { test }) => {
                if let Some(BuilderState::Choose { whens, .. }) = self.state_stack.last_mut() {
                    whens.push((test, body));
                } else {
                    return Err(XsltError::Structure {
                        message: "xsl:when outside xsl:choose".to_string(),
                        location: loc,
                    });
                }
            }
            Some(BuilderState::Otherwise) => {
                if let Some(BuilderState::Choose { otherwise, .. }) = self.state_stack.last_mut() {
                    *otherwise = Some(body);
                } else {
                    return Err(XsltError::Structure {
                        message: "xsl:otherwise outside xsl:choose".to_string(),
                        location: loc,
                    });
                }
            }
            Some(BuilderState::ForEach { select, sorts }) => {
                self.push_instr(Instruction::ForEach { select, sorts, body });
            }
            Some(BuilderState::ApplyTemplates { select, mode, sorts, with_params }) => {
                self.push_instr(Instruction::ApplyTemplates { select, mode, sorts, with_params });
            }
            Some(BuilderState::CallTemplate { name, with_params }) => {
                self.push_instr(Instruction::CallTemplate { name, with_params });
            }
            Some(BuilderState::ApplyImports { with_params }) => {
                self.push_instr(Instruction::ApplyImports { with_params });
            }
            Some(BuilderState::NextMatch { with_params }) => {
                self.push_instr(Instruction::NextMatch { with_params });
            }
            Some(BuilderState::Variable { name, select, is_param }) => {
                let body_opt = if select.is_none() { Some(body) } else { None };
                let at_top_level = matches!(self.state_stack.last(), None | Some(BuilderState::Stylesheet));
                if at_top_level {
                    self.sheet.global_variables.push(GlobalBinding {
                        name,
                        select,
                        body: body_opt,
                        is_param,
                        import_precedence: self.import_precedence,
                    });
                } else if is_param {
                    self.push_instr(Instruction::ParamBinding { name, select, body: body_opt });
                } else {
                    self.push_instr(Instruction::Variable { name, select, body: body_opt });
                }
            }
            Some(BuilderState::AttributeSet { name, uses }) => {
                self.sheet.attribute_sets.insert(
                    name,
                    AttributeSetDef { uses, attributes: body },
                );
            }
            Some(BuilderState::Attribute { name, namespace }) => {
                self.push_instr(Instruction::Attribute { name, namespace, body });
            }
            Some(BuilderState::ElementInstr { name, namespace, use_attribute_sets }) => {
                self.push_instr(Instruction::Element { name, namespace, use_attribute_sets, body });
            }
            Some(BuilderState::Copy { use_attribute_sets }) => {
                self.push_instr(Instruction::Copy { use_attribute_sets, body });
            }
            Some(BuilderState::Text { disable_output_escaping }) => {
                let content: String = body
                    .into_iter()
                    .filter_map(|i| match i {
                        Instruction::LiteralText(t) | Instruction::Text { content: t, .. } => Some(t),
                        _ => None,
                    })
                    .collect();
                self.push_instr(Instruction::Text { disable_output_escaping, content });
            }
            Some(BuilderState::Comment) => self.push_instr(Instruction::Comment { body }),
            Some(BuilderState::Pi { name }) => {
                self.push_instr(Instruction::ProcessingInstruction { name, body });
            }
            Some(BuilderState::Namespace { name, select }) => {
                let body_opt = if select.is_none() { Some(body) } else { None };
                self.push_instr(Instruction::Namespace { name, select, body: body_opt });
            }
            Some(BuilderState::Message { terminate }) => self.push_instr(Instruction::Message { terminate, body }),
            Some(BuilderState::Key { name, match_pattern, use_expr }) => {
                self.sheet
                    .keys
                    .entry(name)
                    .or_default()
                    .push(KeyDef { match_pattern, use_expr });
            }
            Some(BuilderState::DecimalFormatDecl { name, fmt }) => {
                self.sheet.decimal_formats.insert(name, fmt);
            }
            Some(BuilderState::CharacterMapDecl { name, map }) => {
                self.sheet.character_maps.insert(name, map);
            }
            Some(BuilderState::LiteralElement {
                prefix,
                local_name,
                namespace_decls,
                attributes,
                use_attribute_sets,
            }) => {
                self.push_instr(Instruction::LiteralElement {
                    prefix,
                    local_name,
                    namespace_decls,
                    attributes,
                    use_attribute_sets,
                    body,
                });
            }
        }
        Ok(())
    }

    fn dispatch_xsl_start(&mut self, local: &str, attrs: &OwnedAttrs, pos: usize) -> Result<(), XsltError> {
        let get = |name: &str| -> Option<String> {
            attrs.iter().find(|(_, n, _)| n == name).map(|(_, _, v)| v.clone())
        };
        let require = |name: &str, elem: &str, loc: Location| -> Result<String, XsltError> {
            get(name).ok_or_else(|| XsltError::Structure {
                message: format!("xsl:{elem} missing required '{name}' attribute"),
                location: loc,
            })
        };
        let loc = self.location_at(pos);

        match local {
            "stylesheet" | "transform" => self.state_stack.push(BuilderState::Stylesheet),
            "include" | "import" => {
                let href = require("href", local, loc)?;
                let included = self.loader.load(&href)?;
                let precedence = if local == "import" {
                    let p = self.import_precedence;
                    self.import_precedence += 1;
                    p
                } else {
                    self.import_precedence
                };
                let saved_precedence = self.import_precedence;
                self.import_precedence = precedence;
                let mut nested = CompilerBuilder::new(self.loader, &included);
                nested.import_precedence = precedence;
                nested.next_decl_order = self.next_decl_order;
                nested.run()?;
                self.next_decl_order = nested.next_decl_order;
                self.import_precedence = saved_precedence;
                merge_stylesheet(&mut self.sheet, nested.sheet);
                self.state_stack.push(BuilderState::Ignored);
            }
            "output" => {
                let mut output = self.sheet.output.clone();
                if let Some(m) = get("method") {
                    output.method = match m.as_str() {
                        "html" => OutputMethod::Html,
                        "xhtml" => OutputMethod::Xhtml,
                        "text" => OutputMethod::Text,
                        _ => OutputMethod::Xml,
                    };
                }
                if let Some(v) = get("version") {
                    output.version = Some(v);
                }
                if let Some(v) = get("encoding") {
                    output.encoding = v;
                }
                if let Some(v) = get("omit-xml-declaration") {
                    output.omit_xml_declaration = v == "yes";
                }
                if let Some(v) = get("standalone") {
                    output.standalone = Some(v == "yes");
                }
                output.doctype_public = get("doctype-public").or(output.doctype_public);
                output.doctype_system = get("doctype-system").or(output.doctype_system);
                if let Some(v) = get("indent") {
                    output.indent = v == "yes";
                }
                output.media_type = get("media-type").or(output.media_type);
                if let Some(v) = get("cdata-section-elements") {
                    for name in v.split_whitespace() {
                        output.cdata_section_elements.push(split_qname(name));
                    }
                }
                if let Some(v) = get("use-character-maps") {
                    output
                        .use_character_maps
                        .extend(v.split_whitespace().map(str::to_string));
                }
                if let Some(name) = get("name") {
                    self.sheet.named_outputs.insert(name, output);
                } else {
                    self.sheet.output = output;
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "strip-space" => {
                let v = require("elements", local, loc)?;
                for tok in v.split_whitespace() {
                    self.sheet.strip_space_patterns.push(parse_space_pattern(tok));
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "preserve-space" => {
                let v = require("elements", local, loc)?;
                for tok in v.split_whitespace() {
                    self.sheet.preserve_space_patterns.push(parse_space_pattern(tok));
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "decimal-format" => {
                let name = get("name").unwrap_or_default();
                let mut fmt = DecimalFormat::default();
                macro_rules! ch {
                    ($attr:literal, $field:ident) => {
                        if let Some(v) = get($attr) {
                            fmt.$field = v.chars().next().unwrap_or(fmt.$field);
                        }
                    };
                }
                ch!("decimal-separator", decimal_separator);
                ch!("grouping-separator", grouping_separator);
                ch!("minus-sign", minus_sign);
                ch!("percent", percent);
                ch!("per-mille", per_mille);
                ch!("zero-digit", zero_digit);
                ch!("digit", digit);
                ch!("pattern-separator", pattern_separator);
                if let Some(v) = get("infinity") {
                    fmt.infinity = v;
                }
                if let Some(v) = get("NaN") {
                    fmt.nan = v;
                }
                self.state_stack.push(BuilderState::DecimalFormatDecl { name, fmt });
            }
            "namespace-alias" => {
                let stylesheet_prefix = require("stylesheet-prefix", local, loc)?;
                let result_prefix = require("result-prefix", local, loc)?;
                self.sheet.namespace_aliases.push((stylesheet_prefix, result_prefix));
                self.state_stack.push(BuilderState::Ignored);
            }
            "character-map" => {
                let name = require("name", local, loc)?;
                let mut map = CharacterMap::default();
                if let Some(v) = get("use-character-maps") {
                    map.uses.extend(v.split_whitespace().map(str::to_string));
                }
                self.state_stack.push(BuilderState::CharacterMapDecl { name, map });
            }
            "output-character" => {
                let character = require("character", local, loc)?;
                let string = require("string", local, loc)?;
                if let Some(BuilderState::CharacterMapDecl { map, .. }) = self.state_stack.last_mut() {
                    if let Some(c) = character.chars().next() {
                        map.mappings.insert(c, string);
                    }
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "key" => {
                let name = require("name", local, loc)?;
                let match_pattern = pattern::parse(&require("match", local, loc)?)?;
                let use_expr = parse_expression(&require("use", local, loc)?)?;
                self.state_stack.push(BuilderState::Key { name, match_pattern, use_expr });
            }
            "attribute-set" => {
                let name = require("name", local, loc)?;
                let uses = get("use-attribute-sets")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                self.state_stack.push(BuilderState::AttributeSet { name, uses });
            }
            "template" => {
                let match_pattern = get("match").map(|m| pattern::parse(&m)).transpose()?;
                let name = get("name");
                let mode = get("mode");
                let priority = get("priority").and_then(|p| p.parse::<f64>().ok());
                self.state_stack.push(BuilderState::Template {
                    match_pattern,
                    name,
                    mode,
                    priority,
                    params: Vec::new(),
                });
            }
            "param" => {
                let name = require("name", local, loc)?;
                let select = get("select").map(|s| parse_expression(&s)).transpose()?;
                if let Some(BuilderState::Template { params, .. }) = self.state_stack.last_mut() {
                    params.push(Param { name, select, body: None });
                    self.state_stack.push(BuilderState::Ignored);
                } else {
                    self.state_stack.push(BuilderState::Variable { name, select, is_param: true });
                }
            }
            "variable" => {
                let name = require("name", local, loc)?;
                let select = get("select").map(|s| parse_expression(&s)).transpose()?;
                self.state_stack.push(BuilderState::Variable { name, select, is_param: false });
            }
            "with-param" => {
                let name = require("name", local, loc)?;
                let select = parse_expression(&require("select", local, loc)?)?;
                let tunnel = get("tunnel").as_deref() == Some("yes");
                match self.state_stack.last_mut() {
                    Some(BuilderState::CallTemplate { with_params, .. })
                    | Some(BuilderState::ApplyTemplates { with_params, .. })
                    | Some(BuilderState::ApplyImports { with_params })
                    | Some(BuilderState::NextMatch { with_params }) => {
                        with_params.push(WithParam { name, select, tunnel });
                    }
                    _ => {
                        return Err(XsltError::Structure {
                            message: "xsl:with-param outside xsl:call-template, xsl:apply-templates, xsl:apply-imports, or xsl:next-match".to_string(),
                            location: loc,
                        });
                    }
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "call-template" => {
                let name = require("name", local, loc)?;
                self.state_stack.push(BuilderState::CallTemplate { name, with_params: Vec::new() });
            }
            "apply-templates" => {
                let select = get("select").map(|s| parse_expression(&s)).transpose()?;
                let mode = get("mode");
                self.state_stack.push(BuilderState::ApplyTemplates {
                    select,
                    mode,
                    sorts: Vec::new(),
                    with_params: Vec::new(),
                });
            }
            "apply-imports" => {
                self.state_stack.push(BuilderState::ApplyImports { with_params: Vec::new() });
            }
            "next-match" => {
                self.state_stack.push(BuilderState::NextMatch { with_params: Vec::new() });
            }
            "fallback" => self.state_stack.push(BuilderState::Ignored),
            "for-each" => {
                let select = parse_expression(&require("select", local, loc)?)?;
                self.state_stack.push(BuilderState::ForEach { select, sorts: Vec::new() });
            }
            "sort" => {
                let select = get("select").map(|s| parse_expression(&s)).transpose()?.unwrap_or(
                    parse_expression(".")?,
                );
                let sort_key = SortKey {
                    select,
                    descending: get("order").as_deref() == Some("descending"),
                    numeric: get("data-type").as_deref() == Some("number"),
                    upper_first: get("case-order").map(|v| v == "upper-first"),
                    lang: get("lang"),
                    collation: get("collation"),
                    stable: true,
                };
                match self.state_stack.last_mut() {
                    Some(BuilderState::ForEach { sorts, .. })
                    | Some(BuilderState::ApplyTemplates { sorts, .. }) => sorts.push(sort_key),
                    _ => warn!("xsl:sort outside xsl:for-each/xsl:apply-templates ignored"),
                }
                self.state_stack.push(BuilderState::Ignored);
            }
            "if" => {
                let test = parse_expression(&require("test", local, loc)?)?;
                self.state_stack.push(BuilderState::If { test });
            }
            "choose" => self.state_stack.push(BuilderState::Choose { whens: Vec::new(), otherwise: None }),
            "when" => {
                let test = parse_expression(&require("test", local, loc)?)?;
                self.state_stack.push(BuilderState::When { test });
            }
            "otherwise" => self.state_stack.push(BuilderState::Otherwise),
            "copy" => {
                let uses = get("use-attribute-sets")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                self.state_stack.push(BuilderState::Copy { use_attribute_sets: uses });
            }
            "copy-of" => {
                let select = parse_expression(&require("select", local, loc)?)?;
                self.push_instr(Instruction::CopyOf { select });
                self.state_stack.push(BuilderState::Ignored);
            }
            "element" => {
                let name = parse_avt(&require("name", local, loc)?)?;
                let namespace = get("namespace").map(|s| parse_avt(&s)).transpose()?;
                let use_attribute_sets = get("use-attribute-sets")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                self.state_stack.push(BuilderState::ElementInstr { name, namespace, use_attribute_sets });
            }
            "attribute" => {
                let name = parse_avt(&require("name", local, loc)?)?;
                let namespace = get("namespace").map(|s| parse_avt(&s)).transpose()?;
                self.state_stack.push(BuilderState::Attribute { name, namespace });
            }
            "text" => {
                let disable_output_escaping = get("disable-output-escaping").as_deref() == Some("yes");
                self.state_stack.push(BuilderState::Text { disable_output_escaping });
            }
            "value-of" => {
                let select = parse_expression(&require("select", local, loc)?)?;
                let separator = get("separator").map(|s| parse_avt(&s)).transpose()?;
                let disable_output_escaping = get("disable-output-escaping").as_deref() == Some("yes");
                self.push_instr(Instruction::ValueOf { select, separator, disable_output_escaping });
                self.state_stack.push(BuilderState::Ignored);
            }
            "number" => {
                let level = match get("level").as_deref() {
                    Some("multiple") => NumberLevel::Multiple,
                    Some("any") => NumberLevel::Any,
                    _ => NumberLevel::Single,
                };
                let count = get("count").map(|p| pattern::parse(&p)).transpose()?;
                let from = get("from").map(|p| pattern::parse(&p)).transpose()?;
                let value = get("value").map(|s| parse_expression(&s)).transpose()?;
                let format = get("format").unwrap_or_else(|| "1".to_string());
                let grouping_separator = get("grouping-separator").and_then(|s| s.chars().next());
                let grouping_size = get("grouping-size").and_then(|s| s.parse().ok());
                self.push_instr(Instruction::Number(NumberInstr {
                    level,
                    count,
                    from,
                    value,
                    format,
                    lang: get("lang"),
                    grouping_separator,
                    grouping_size,
                }));
                self.state_stack.push(BuilderState::Ignored);
            }
            "message" => {
                let terminate = get("terminate").as_deref() == Some("yes");
                self.state_stack.push(BuilderState::Message { terminate });
            }
            "comment" => self.state_stack.push(BuilderState::Comment),
            "processing-instruction" => {
                let name = parse_avt(&require("name", local, loc)?)?;
                self.state_stack.push(BuilderState::Pi { name });
            }
            "namespace" => {
                let name = parse_avt(&require("name", local, loc)?)?;
                let select = get("select").map(|s| parse_expression(&s)).transpose()?;
                self.state_stack.push(BuilderState::Namespace { name, select });
            }
            other => {
                return Err(XsltError::Structure {
                    message: format!("unsupported xsl:{other} element"),
                    location: loc,
                });
            }
        }
        Ok(())
    }
}

fn split_qname(raw: &str) -> (Option<String>, String) {
    match raw.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, raw.to_string()),
    }
}

fn parse_space_pattern(tok: &str) -> SpacePattern {
    if tok == "*" {
        SpacePattern::AnyElement
    } else if let Some(prefix) = tok.strip_suffix(":*") {
        SpacePattern::PrefixWildcard(Some(prefix.to_string()))
    } else {
        let (prefix, local) = split_qname(tok);
        SpacePattern::QName(prefix, local)
    }
}

/// Parses an attribute value template: `{` starts an embedded expression,
/// `}` closes it, and `{{`/`}}` are literal braces.
pub fn parse_avt(text: &str) -> Result<Avt, XsltError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                if !literal.is_empty() {
                    parts.push(AvtPart::Literal(std::mem::take(&mut literal)));
                }
                let mut expr_src = String::new();
                let mut depth = 1;
                for (_, c2) in chars.by_ref() {
                    if c2 == '{' {
                        depth += 1;
                    } else if c2 == '}' {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    expr_src.push(c2);
                }
                if depth != 0 {
                    return Err(XsltError::Compilation(format!(
                        "unterminated attribute value template in '{text}'"
                    )));
                }
                parts.push(AvtPart::Expr(parse_expression(&expr_src)?));
            }
            '}' => {
                return Err(XsltError::Compilation(format!(
                    "unmatched '}}' in attribute value template '{text}'"
                )));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() || parts.is_empty() {
        parts.push(AvtPart::Literal(literal));
    }
    Ok(Avt(parts))
}

/// Merges an included/imported stylesheet's declarations into `into`.
/// Templates, keys, and attribute sets accumulate; output/decimal-format
/// properties from a higher-precedence (later, or local over imported)
/// sheet win, per the cascading-declaration model in the processing rules.
fn merge_stylesheet(into: &mut CompiledStylesheet, mut other: CompiledStylesheet) {
    for (name, idx) in other.named_templates.drain() {
        into.named_templates.insert(name, idx + into.templates.len());
    }
    into.templates.append(&mut other.templates);
    into.global_variables.append(&mut other.global_variables);
    for (name, mut defs) in other.keys {
        into.keys.entry(name).or_default().append(&mut defs);
    }
    for (name, set) in other.attribute_sets {
        into.attribute_sets.entry(name).or_insert(set);
    }
    for (name, out) in other.named_outputs {
        into.named_outputs.entry(name).or_insert(out);
    }
    for (name, map) in other.character_maps {
        into.character_maps.entry(name).or_insert(map);
    }
    into.strip_space_patterns.append(&mut other.strip_space_patterns);
    into.preserve_space_patterns.append(&mut other.preserve_space_patterns);
    for (name, fmt) in other.decimal_formats {
        into.decimal_formats.entry(name).or_insert(fmt);
    }
    into.namespace_aliases.append(&mut other.namespace_aliases);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_identity_transform() {
        let src = r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
            <xsl:template match="node()|@*">
                <xsl:copy>
                    <xsl:apply-templates select="node()|@*"/>
                </xsl:copy>
            </xsl:template>
        </xsl:stylesheet>"#;
        let sheet = compile(src, &NullLoader).unwrap();
        assert_eq!(sheet.templates.len(), 1);
        assert_eq!(sheet.templates[0].body.len(), 1);
    }

    #[test]
    fn avt_parses_mixed_literal_and_expr() {
        let avt = parse_avt("item-{@id}-end").unwrap();
        assert_eq!(avt.0.len(), 3);
        assert!(!avt.is_literal());
    }

    #[test]
    fn avt_unescapes_doubled_braces() {
        let avt = parse_avt("{{literal}}").unwrap();
        assert!(avt.is_literal());
    }

    #[test]
    fn assigns_default_priorities() {
        let src = r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
            <xsl:template match="para"><xsl:text>a</xsl:text></xsl:template>
            <xsl:template match="*"><xsl:text>b</xsl:text></xsl:template>
        </xsl:stylesheet>"#;
        let sheet = compile(src, &NullLoader).unwrap();
        assert_eq!(sheet.templates[0].priority, 0.0);
        assert_eq!(sheet.templates[1].priority, -0.5);
    }
}
