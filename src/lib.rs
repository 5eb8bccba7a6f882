//! XSLT 1.0+ transformation engine: stylesheet compiler, XPath engine, and
//! serializer, assembled from [`xsltransform_xpath`] and [`xsltransform_xslt`].
//!
//! This crate is a thin facade: the algorithmic substance lives in the two
//! path-dependency crates. It exists so a caller depends on one crate name
//! and one top-level `Stylesheet` entry point instead of wiring the compiler,
//! runtime, and node-tree parser together itself.

pub use xsltransform_xpath as xpath;
pub use xsltransform_xslt as xslt;

pub use xsltransform_xslt::compiler::{NullLoader, StylesheetLoader};
pub use xsltransform_xslt::error::{ErrorHandlingMode, RecoverableKind, XsltError};
pub use xsltransform_xslt::runtime::TransformOptions;

use xsltransform_xslt::ast::CompiledStylesheet;
use xsltransform_xslt::runtime::Transformation;

/// A compiled stylesheet, ready to transform any number of source documents.
///
/// Immutable once built, so a single `Stylesheet` may be shared (behind an
/// `Arc`, if callers run more than one transformation concurrently) across
/// transformations without locking; each [`Stylesheet::transform`] call
/// parses its own source tree and allocates its own mutable runtime state.
pub struct Stylesheet {
    compiled: CompiledStylesheet,
}

impl Stylesheet {
    /// Compiles a stylesheet source string, rejecting any `xsl:include` or
    /// `xsl:import`.
    pub fn compile(source: &str) -> Result<Self, XsltError> {
        Self::compile_with_loader(source, &NullLoader)
    }

    /// Compiles a stylesheet source string, resolving `xsl:include`/
    /// `xsl:import` hrefs through the given loader.
    pub fn compile_with_loader(source: &str, loader: &dyn StylesheetLoader) -> Result<Self, XsltError> {
        let compiled = xsltransform_xslt::compiler::compile(source, loader)?;
        Ok(Stylesheet { compiled })
    }

    /// Transforms a source XML document, returning the serialized result.
    ///
    /// This is entry points (a) and (c) of the processing model when
    /// `options.initial_template` is unset (plain `apply-templates` to the
    /// root, or to `options.initial_select`'s result against the root), and
    /// entry point (b) when it is set (invoke a named template directly).
    pub fn transform(&self, source_xml: &str, options: &TransformOptions) -> Result<String, XsltError> {
        let doc = xsltransform_xslt::xml_events::parse_document(source_xml)?;
        let root = doc.root();
        let mut transformation = Transformation::new(&self.compiled, root, options);
        transformation.run(options)
    }

    /// The underlying compiled AST, for callers that want to drive a custom
    /// node source or output sink via [`xsltransform_xslt::runtime::Transformation`] directly.
    pub fn compiled(&self) -> &CompiledStylesheet {
        &self.compiled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transform_round_trips() {
        let sheet = Stylesheet::compile(
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
                 <xsl:template match="@*|node()">
                   <xsl:copy><xsl:apply-templates select="@*|node()"/></xsl:copy>
                 </xsl:template>
               </xsl:stylesheet>"#,
        )
        .unwrap();
        let out = sheet
            .transform(r#"<a><b x="1">text</b></a>"#, &TransformOptions::default())
            .unwrap();
        assert!(out.contains(r#"<a><b x="1">text</b></a>"#));
    }

    #[test]
    fn priority_ordering_picks_more_specific_template() {
        let sheet = Stylesheet::compile(
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
                 <xsl:template match="*">any<xsl:apply-templates/></xsl:template>
                 <xsl:template match="b">b</xsl:template>
               </xsl:stylesheet>"#,
        )
        .unwrap();
        let options = TransformOptions {
            output_override: Some(xsltransform_xslt::ast::OutputProperties {
                omit_xml_declaration: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = sheet.transform(r#"<a><b/></a>"#, &options).unwrap();
        assert_eq!(out, "anyb");
    }
}
