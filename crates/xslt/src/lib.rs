//! Stylesheet compiler, transformation runtime, and output serializer for
//! the XSLT 1.0+ engine, layered on [`xsltransform_xpath`]'s expression
//! engine and a generic source node tree (see [`tree`]).
pub mod ast;
pub mod compiler;
pub mod error;
pub mod matcher;
pub mod pattern;
pub mod runtime;
pub mod serializer;
pub mod tree;
pub mod xml_events;

pub use ast::CompiledStylesheet;
pub use compiler::{NullLoader, StylesheetLoader, compile};
pub use error::{ErrorHandlingMode, Location, RecoverableKind, XsltError};
pub use runtime::{TransformOptions, Transformation};
pub use serializer::Serializer;
pub use tree::{Document, Node};
pub use xml_events::parse_document;
