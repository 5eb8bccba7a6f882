//! Turns the flat stream of output events the transformation runtime
//! produces into serialized text, following the output-method-specific
//! rules (`xml`/`html`/`xhtml`/`text`), deferred start-tag flushing,
//! character-map substitution, CDATA-section wrapping, and indentation.
use std::collections::HashMap;

use crate::ast::{OutputMethod, OutputProperties};
use crate::error::{ErrorHandlingMode, RecoverableKind, XsltError};

/// HTML elements that never have a closing tag or content, used to decide
/// when the `html` output method self-closes vs. always emits `</tag>`.
const HTML_VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

struct PendingElement {
    name: String,
    attrs: Vec<(String, String)>,
    namespaces: Vec<(Option<String>, String)>,
    start_flushed: bool,
    has_content: bool,
    has_text_child: bool,
    has_element_child: bool,
    suppress_indent: bool,
    is_cdata_target: bool,
}

pub struct Serializer {
    out: String,
    props: OutputProperties,
    character_map: HashMap<char, String>,
    stack: Vec<PendingElement>,
    error_mode: ErrorHandlingMode,
    started_document: bool,
}

impl Serializer {
    pub fn new(props: OutputProperties, character_map: HashMap<char, String>, error_mode: ErrorHandlingMode) -> Self {
        Serializer {
            out: String::new(),
            props,
            character_map,
            stack: Vec::new(),
            error_mode,
            started_document: false,
        }
    }

    pub fn start_document(&mut self) {
        if self.started_document {
            return;
        }
        self.started_document = true;
        if matches!(self.props.method, OutputMethod::Xml) && !self.props.omit_xml_declaration {
            let version = self.props.version.as_deref().unwrap_or("1.0");
            self.out.push_str("<?xml version=\"");
            self.out.push_str(version);
            self.out.push_str("\" encoding=\"");
            self.out.push_str(&self.props.encoding);
            self.out.push('"');
            if let Some(standalone) = self.props.standalone {
                self.out.push_str(if standalone {
                    " standalone=\"yes\""
                } else {
                    " standalone=\"no\""
                });
            }
            self.out.push_str("?>\n");
        }
        if let Some(system) = self.props.doctype_system.clone() {
            let root_name = "root";
            match self.props.doctype_public.clone() {
                Some(public) => {
                    self.out
                        .push_str(&format!("<!DOCTYPE {root_name} PUBLIC \"{public}\" \"{system}\">\n"));
                }
                None => {
                    self.out.push_str(&format!("<!DOCTYPE {root_name} SYSTEM \"{system}\">\n"));
                }
            }
        }
    }

    pub fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            let name = self.stack.last().unwrap().name.clone();
            self.end_element(&name);
        }
        self.out
    }

    fn is_text_method(&self) -> bool {
        self.props.method == OutputMethod::Text
    }

    fn flush_start(&mut self, parent_idx: Option<usize>) {
        if let Some(idx) = parent_idx {
            let already = self.stack[idx].start_flushed;
            if already {
                return;
            }
            self.stack[idx].start_flushed = true;
            if self.is_text_method() {
                return;
            }
            let indent = if self.stack[idx].suppress_indent {
                String::new()
            } else {
                self.indent_for_depth(idx)
            };
            self.out.push_str(&indent);
            self.out.push('<');
            self.out.push_str(&self.stack[idx].name);
            for (prefix, uri) in self.stack[idx].namespaces.clone() {
                match prefix {
                    Some(p) => self.out.push_str(&format!(" xmlns:{p}=\"{}\"", escape_attr(&uri))),
                    None => self.out.push_str(&format!(" xmlns=\"{}\"", escape_attr(&uri))),
                }
            }
            for (name, value) in self.stack[idx].attrs.clone() {
                self.out.push(' ');
                self.out.push_str(&name);
                self.out.push_str("=\"");
                self.out.push_str(&escape_attr(&value));
                self.out.push('"');
            }
            self.out.push('>');
        }
    }

    fn indent_for_depth(&self, idx: usize) -> String {
        if !self.props.indent {
            return String::new();
        }
        if idx == 0 && !self.started_document {
            return String::new();
        }
        let mut s = String::from("\n");
        s.push_str(&"  ".repeat(idx));
        s
    }

    fn mark_parent_has_content(&mut self) -> Option<usize> {
        let idx = self.stack.len().checked_sub(1);
        if let Some(i) = idx {
            self.flush_start(Some(i));
            self.stack[i].has_content = true;
        }
        idx
    }

    pub fn start_element(
        &mut self,
        name: &str,
        namespaces: Vec<(Option<String>, String)>,
    ) {
        self.start_document();
        let parent_idx = self.mark_parent_has_content();
        let suppress_indent = parent_idx.is_some_and(|i| {
            self.stack[i].has_text_child || self.stack[i].suppress_indent
        });
        if let Some(i) = parent_idx {
            self.stack[i].has_element_child = true;
        }
        let is_cdata_target = self
            .props
            .cdata_section_elements
            .iter()
            .any(|(_, local)| name.rsplit(':').next() == Some(local.as_str()));
        self.stack.push(PendingElement {
            name: name.to_string(),
            attrs: Vec::new(),
            namespaces,
            start_flushed: false,
            has_content: false,
            has_text_child: false,
            has_element_child: false,
            suppress_indent,
            is_cdata_target,
        });
    }

    /// Adds an attribute to the element currently on top of the stack.
    /// Recoverable if the start tag has already been flushed (content was
    /// already added) — per the deferred-start-tag invariant.
    pub fn attribute(&mut self, name: &str, value: &str) -> Result<(), XsltError> {
        let Some(top) = self.stack.last_mut() else {
            return Err(XsltError::Structure {
                message: "xsl:attribute outside any element".to_string(),
                location: Default::default(),
            });
        };
        if top.start_flushed {
            let message = format!(
                "attribute '{}' added after the start tag for '{}' was already flushed",
                name, top.name
            );
            return match self.error_mode {
                ErrorHandlingMode::Strict => Err(XsltError::Recoverable {
                    kind: RecoverableKind::AttributeAfterContent,
                    message,
                }),
                ErrorHandlingMode::Recover => {
                    log::warn!("{message}");
                    Ok(())
                }
                ErrorHandlingMode::Silent => Ok(()),
            };
        }
        if let Some(existing) = top.attrs.iter_mut().find(|(n, _)| n == name) {
            existing.1 = value.to_string();
        } else {
            top.attrs.push((name.to_string(), value.to_string()));
        }
        Ok(())
    }

    pub fn text(&mut self, text: &str, disable_output_escaping: bool) {
        if text.is_empty() {
            return;
        }
        self.start_document();
        if let Some(idx) = self.mark_parent_has_content() {
            self.stack[idx].has_text_child = true;
        }
        if self.is_text_method() {
            self.out.push_str(text);
            return;
        }
        let cdata_target = self.stack.last().is_some_and(|e| e.is_cdata_target);
        if disable_output_escaping {
            self.out.push_str(text);
        } else if cdata_target {
            self.out.push_str("<![CDATA[");
            self.out.push_str(&text.replace("]]>", "]]]]><![CDATA[>"));
            self.out.push_str("]]>");
        } else {
            self.out.push_str(&self.escape_with_character_map(text));
        }
    }

    fn escape_with_character_map(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if let Some(replacement) = self.character_map.get(&c) {
                out.push_str(replacement);
            } else {
                match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    _ => out.push(c),
                }
            }
        }
        out
    }

    pub fn comment(&mut self, text: &str) {
        if self.is_text_method() {
            return;
        }
        self.start_document();
        self.mark_parent_has_content();
        self.out.push_str("<!--");
        self.out.push_str(text);
        self.out.push_str("-->");
    }

    pub fn processing_instruction(&mut self, target: &str, data: &str) {
        if self.is_text_method() {
            return;
        }
        self.start_document();
        self.mark_parent_has_content();
        self.out.push_str("<?");
        self.out.push_str(target);
        if !data.is_empty() {
            self.out.push(' ');
            self.out.push_str(data);
        }
        self.out.push_str("?>");
    }

    pub fn end_element(&mut self, name: &str) {
        let Some(idx) = self.stack.iter().rposition(|e| e.name == name) else {
            return;
        };
        while self.stack.len() > idx + 1 {
            let child_name = self.stack.last().unwrap().name.clone();
            self.end_element(&child_name);
        }
        self.flush_start(Some(idx));
        let elem = self.stack.pop().unwrap();
        if self.is_text_method() {
            return;
        }
        let is_html_void = matches!(self.props.method, OutputMethod::Html)
            && HTML_VOID_ELEMENTS.contains(&elem.name.as_str());
        if !elem.has_content {
            if is_html_void {
                // already emitted as "<tag ...>", no closing tag for HTML void elements.
                return;
            }
            // Rewind the '>' we wrote on flush and self-close instead.
            if self.out.ends_with('>') && matches!(self.props.method, OutputMethod::Xml | OutputMethod::Xhtml) {
                self.out.truncate(self.out.len() - 1);
                self.out.push_str("/>");
                return;
            }
        }
        if is_html_void {
            return;
        }
        if self.props.indent && elem.has_element_child && !elem.suppress_indent {
            self.out.push('\n');
            self.out.push_str(&"  ".repeat(self.stack.len()));
        }
        self.out.push_str("</");
        self.out.push_str(&elem.name);
        self.out.push('>');
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml_serializer() -> Serializer {
        Serializer::new(OutputProperties::default(), HashMap::new(), ErrorHandlingMode::Recover)
    }

    #[test]
    fn serializes_simple_element_with_text() {
        let mut s = xml_serializer();
        s.start_element("root", vec![]);
        s.attribute("id", "1").unwrap();
        s.text("hello", false);
        s.end_element("root");
        let out = s.finish();
        assert!(out.contains("<root id=\"1\">hello</root>"));
    }

    #[test]
    fn self_closes_empty_elements() {
        let mut s = xml_serializer();
        s.start_element("br", vec![]);
        s.end_element("br");
        let out = s.finish();
        assert!(out.contains("<br/>"));
    }

    #[test]
    fn escapes_reserved_characters() {
        let mut s = xml_serializer();
        s.start_element("a", vec![]);
        s.text("<tag> & \"quote\"", false);
        s.end_element("a");
        let out = s.finish();
        assert!(out.contains("&lt;tag&gt; &amp; "));
    }

    #[test]
    fn attribute_after_content_is_recoverable() {
        let mut s = xml_serializer();
        s.start_element("a", vec![]);
        s.text("x", false);
        let result = s.attribute("y", "1");
        assert!(result.is_ok());
    }

    #[test]
    fn text_method_drops_markup() {
        let mut s = Serializer::new(
            OutputProperties {
                method: OutputMethod::Text,
                ..Default::default()
            },
            HashMap::new(),
            ErrorHandlingMode::Recover,
        );
        s.start_element("a", vec![]);
        s.attribute("id", "1").unwrap();
        s.text("hello", false);
        s.end_element("a");
        assert_eq!(s.finish(), "hello");
    }
}
