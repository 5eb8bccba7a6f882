//! Error types for the stylesheet compiler, transformation runtime, and serializer.
use thiserror::Error;
use xsltransform_xpath::XPathError;

/// A source position, used for both stylesheet-compile errors and XPath errors
/// re-attached to a location within the stylesheet that referenced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.col)
    }
}

impl From<(usize, usize)> for Location {
    fn from((line, col): (usize, usize)) -> Self {
        Location { line, col }
    }
}

#[derive(Error, Debug)]
pub enum XsltError {
    #[error("XML parsing error: {0}")]
    XmlParse(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("XPath error: {0}")]
    XPath(#[from] XPathError),

    #[error("malformed node-tree event sequence: {0}")]
    TreeBuild(String),

    #[error("stylesheet structure error at {location}: {message}")]
    Structure { message: String, location: Location },

    #[error("stylesheet compilation error: {0}")]
    Compilation(String),

    #[error("template execution error: {0}")]
    Execution(String),

    #[error("{kind} is recoverable: {message}")]
    Recoverable {
        kind: RecoverableKind,
        message: String,
    },

    #[error("transformation terminated: {0}")]
    Terminated(String),

    #[error("transformation cancelled")]
    Cancelled,
}

/// The family of recoverable error described in the processing model: under
/// `RECOVER`/`SILENT` these are logged (or not) and execution continues with a
/// best-effort substitution; under `STRICT` they escalate to a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    MultipleTemplateMatches,
    DuplicateAttribute,
    AttributeAfterContent,
    NonRepresentableCharacter,
    MissingCdataTarget,
    MalformedCommentOrPi,
}

impl std::fmt::Display for RecoverableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoverableKind::MultipleTemplateMatches => "multiple templates match",
            RecoverableKind::DuplicateAttribute => "duplicate attribute",
            RecoverableKind::AttributeAfterContent => "attribute added after start tag flushed",
            RecoverableKind::NonRepresentableCharacter => "character not representable in encoding",
            RecoverableKind::MissingCdataTarget => "cdata-section-elements target not found",
            RecoverableKind::MalformedCommentOrPi => "malformed comment or processing instruction content",
        };
        write!(f, "{}", s)
    }
}

/// How the runtime should react when it hits a [`RecoverableKind`] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandlingMode {
    /// Raise immediately; spec-conformant.
    Strict,
    /// Log to the error listener, substitute a default, and continue.
    #[default]
    Recover,
    /// Substitute a default silently, no log.
    Silent,
}
