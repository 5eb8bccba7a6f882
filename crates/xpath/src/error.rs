use thiserror::Error;

/// A source position within an expression or stylesheet, 0-based character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub offset: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {}", self.offset)
    }
}

impl From<usize> for Location {
    fn from(offset: usize) -> Self {
        Location { offset }
    }
}

#[derive(Error, Debug, Clone)]
pub enum XPathError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("XPath parse error in '{0}': {1}")]
    XPathParse(String, String),

    #[error("Function '{function}' error: {message}")]
    FunctionError { function: String, message: String },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Variable '{0}' not found")]
    UnknownVariable(String),

    #[error("Context node required")]
    NoContextNode,

    #[error("Invalid regular expression '{0}': {1}")]
    InvalidRegex(String, String),

    #[error("Cast to '{0}' failed for value '{1}'")]
    CastFailure(String, String),
}
