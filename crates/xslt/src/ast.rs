//! The compiled stylesheet: the XSLT instruction AST plus every top-level
//! declaration a stylesheet can carry, following the same "variant dispatch,
//! no class hierarchy" shape this codebase's XPath AST already uses.
use std::collections::HashMap;

use xsltransform_xpath::Expression;

use crate::pattern::Pattern;

pub type XPathExpr = Expression;

/// One piece of an attribute-value template: either literal text or a `{expr}`.
#[derive(Debug, Clone)]
pub enum AvtPart {
    Literal(String),
    Expr(XPathExpr),
}

/// A parsed attribute value template (`{{` / `}}` already unescaped into
/// literal braces at parse time, per the literal-AVT-escape invariant).
#[derive(Debug, Clone, Default)]
pub struct Avt(pub Vec<AvtPart>);

impl Avt {
    pub fn literal(s: impl Into<String>) -> Self {
        Avt(vec![AvtPart::Literal(s.into())])
    }

    pub fn is_literal(&self) -> bool {
        !self.0.iter().any(|p| matches!(p, AvtPart::Expr(_)))
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub select: Option<XPathExpr>,
    pub body: Option<Vec<Instruction>>,
}

#[derive(Debug, Clone)]
pub struct WithParam {
    pub name: String,
    pub select: XPathExpr,
    pub tunnel: bool,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub select: XPathExpr,
    pub descending: bool,
    pub numeric: bool,
    pub upper_first: Option<bool>,
    pub lang: Option<String>,
    pub collation: Option<String>,
    pub stable: bool,
}

#[derive(Debug, Clone)]
pub struct LiteralAttr {
    pub prefix: Option<String>,
    pub local_name: String,
    pub value: Avt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberLevel {
    Single,
    Multiple,
    Any,
}

#[derive(Debug, Clone)]
pub struct NumberInstr {
    pub level: NumberLevel,
    pub count: Option<Pattern>,
    pub from: Option<Pattern>,
    pub value: Option<XPathExpr>,
    pub format: String,
    pub lang: Option<String>,
    pub grouping_separator: Option<char>,
    pub grouping_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Character data copied verbatim from the stylesheet's own text nodes.
    LiteralText(String),
    /// A non-XSLT element appearing in a template body, copied through with
    /// its attributes re-evaluated as AVTs.
    LiteralElement {
        prefix: Option<String>,
        local_name: String,
        namespace_decls: Vec<(Option<String>, String)>,
        attributes: Vec<LiteralAttr>,
        use_attribute_sets: Vec<String>,
        body: Vec<Instruction>,
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
    ForEach {
        select: XPathExpr,
        sorts: Vec<SortKey>,
        body: Vec<Instruction>,
    },
    Variable {
        name: String,
        select: Option<XPathExpr>,
        body: Option<Vec<Instruction>>,
    },
    ParamBinding {
        name: String,
        select: Option<XPathExpr>,
        body: Option<Vec<Instruction>>,
    },
    If {
        test: XPathExpr,
        body: Vec<Instruction>,
    },
    Choose {
        whens: Vec<(XPathExpr, Vec<Instruction>)>,
        otherwise: Option<Vec<Instruction>>,
    },
    Copy {
        use_attribute_sets: Vec<String>,
        body: Vec<Instruction>,
    },
    CopyOf {
        select: XPathExpr,
    },
    Element {
        name: Avt,
        namespace: Option<Avt>,
        use_attribute_sets: Vec<String>,
        body: Vec<Instruction>,
    },
    Attribute {
        name: Avt,
        namespace: Option<Avt>,
        body: Vec<Instruction>,
    },
    Text {
        disable_output_escaping: bool,
        content: String,
    },
    ValueOf {
        select: XPathExpr,
        separator: Option<Avt>,
        disable_output_escaping: bool,
    },
    Number(NumberInstr),
    Message {
        terminate: bool,
        body: Vec<Instruction>,
    },
    Comment {
        body: Vec<Instruction>,
    },
    ProcessingInstruction {
        name: Avt,
        body: Vec<Instruction>,
    },
    Namespace {
        name: Avt,
        select: Option<XPathExpr>,
        body: Option<Vec<Instruction>>,
    },
    ApplyImports {
        with_params: Vec<WithParam>,
    },
    NextMatch {
        with_params: Vec<WithParam>,
    },
    Fallback {
        body: Vec<Instruction>,
    },
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: Option<String>,
    pub mode: Option<String>,
    pub pattern: Option<Pattern>,
    pub priority: f64,
    pub import_precedence: u32,
    pub decl_order: u32,
    pub params: Vec<Param>,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone)]
pub struct GlobalBinding {
    pub name: String,
    pub select: Option<XPathExpr>,
    pub body: Option<Vec<Instruction>>,
    pub is_param: bool,
    pub import_precedence: u32,
}

#[derive(Debug, Clone)]
pub struct KeyDef {
    pub match_pattern: Pattern,
    pub use_expr: XPathExpr,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeSetDef {
    pub uses: Vec<String>,
    pub attributes: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMethod {
    Xml,
    Html,
    Xhtml,
    Text,
}

#[derive(Debug, Clone)]
pub struct OutputProperties {
    pub method: OutputMethod,
    pub version: Option<String>,
    pub encoding: String,
    pub omit_xml_declaration: bool,
    pub standalone: Option<bool>,
    pub doctype_public: Option<String>,
    pub doctype_system: Option<String>,
    pub cdata_section_elements: Vec<(Option<String>, String)>,
    pub indent: bool,
    pub media_type: Option<String>,
    pub use_character_maps: Vec<String>,
}

impl Default for OutputProperties {
    fn default() -> Self {
        OutputProperties {
            method: OutputMethod::Xml,
            version: None,
            encoding: "UTF-8".to_string(),
            omit_xml_declaration: false,
            standalone: None,
            doctype_public: None,
            doctype_system: None,
            cdata_section_elements: Vec::new(),
            indent: false,
            media_type: None,
            use_character_maps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CharacterMap {
    pub mappings: HashMap<char, String>,
    pub uses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DecimalFormat {
    pub decimal_separator: char,
    pub grouping_separator: char,
    pub infinity: String,
    pub minus_sign: char,
    pub nan: String,
    pub percent: char,
    pub per_mille: char,
    pub zero_digit: char,
    pub digit: char,
    pub pattern_separator: char,
}

impl Default for DecimalFormat {
    fn default() -> Self {
        DecimalFormat {
            decimal_separator: '.',
            grouping_separator: ',',
            infinity: "Infinity".to_string(),
            minus_sign: '-',
            nan: "NaN".to_string(),
            percent: '%',
            per_mille: '\u{2030}',
            zero_digit: '0',
            digit: '#',
            pattern_separator: ';',
        }
    }
}

/// A `strip-space`/`preserve-space` element-name pattern, ordered here by
/// specificity tier (exact QName > prefixed wildcard > bare wildcard), the
/// same tiering template-pattern priorities use.
#[derive(Debug, Clone)]
pub enum SpacePattern {
    AnyElement,
    PrefixWildcard(Option<String>),
    QName(Option<String>, String),
}

impl SpacePattern {
    pub fn specificity(&self) -> u8 {
        match self {
            SpacePattern::QName(..) => 2,
            SpacePattern::PrefixWildcard(_) => 1,
            SpacePattern::AnyElement => 0,
        }
    }

    pub fn matches(&self, prefix: Option<&str>, local: &str) -> bool {
        match self {
            SpacePattern::AnyElement => true,
            SpacePattern::PrefixWildcard(p) => p.as_deref() == prefix,
            SpacePattern::QName(p, name) => p.as_deref() == prefix && name == local,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledStylesheet {
    pub templates: Vec<Template>,
    pub named_templates: HashMap<String, usize>,
    pub global_variables: Vec<GlobalBinding>,
    pub keys: HashMap<String, Vec<KeyDef>>,
    pub attribute_sets: HashMap<String, AttributeSetDef>,
    pub output: OutputProperties,
    pub named_outputs: HashMap<String, OutputProperties>,
    pub character_maps: HashMap<String, CharacterMap>,
    pub strip_space_patterns: Vec<SpacePattern>,
    pub preserve_space_patterns: Vec<SpacePattern>,
    pub decimal_formats: HashMap<String, DecimalFormat>,
    pub namespace_aliases: Vec<(String, String)>,
}
