//! A `quick-xml`-backed driver that turns bytes into the SAX-style calls
//! [`crate::tree::TreeBuilder`] expects — the only event source this engine
//! has ever needed, the same division of labor the rest of this codebase's
//! parsers keep between "dumb" XML driver and the builder it feeds.
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};

use crate::error::XsltError;
use crate::tree::{Document, TreeBuilder};

pub fn parse_document(source: &str) -> Result<Document, XsltError> {
    let mut builder = TreeBuilder::new();
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    builder.start_document();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => handle_start(&mut builder, &e, false)?,
            Event::Empty(e) => handle_start(&mut builder, &e, true)?,
            Event::End(_) => builder.end_element()?,
            Event::Text(e) => {
                let raw = std::str::from_utf8(e.as_ref())?;
                let text = unescape(raw)
                    .map_err(|err| XsltError::Compilation(err.to_string()))?;
                builder.characters(&text);
            }
            Event::CData(e) => {
                let text = std::str::from_utf8(e.as_ref())?;
                builder.characters(text);
            }
            Event::Comment(e) => {
                let text = std::str::from_utf8(e.as_ref())?;
                builder.comment(text);
            }
            Event::PI(e) => {
                let raw = std::str::from_utf8(e.as_ref())?;
                let (target, data) = raw.split_once(char::is_whitespace).unwrap_or((raw, ""));
                builder.processing_instruction(target, data.trim_start());
            }
            Event::Decl(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
        buf.clear();
    }
    builder.end_document()?;
    Ok(builder.finish())
}

fn handle_start(builder: &mut TreeBuilder, e: &BytesStart, empty: bool) -> Result<(), XsltError> {
    let (ns_decls, attrs) = split_attributes(e)?;
    for (prefix, uri) in ns_decls {
        builder.start_prefix_mapping(prefix, uri);
    }
    let raw_name = std::str::from_utf8(e.name().as_ref())?.to_string();
    let (prefix, local) = split_qname(&raw_name);
    builder.start_element(prefix, local, attrs)?;
    if empty {
        builder.end_element()?;
    }
    Ok(())
}

type NsDecl = (Option<String>, String);
type Attr = (Option<String>, String, String);

fn split_attributes(e: &BytesStart) -> Result<(Vec<NsDecl>, Vec<Attr>), XsltError> {
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

fn split_qname(raw: &str) -> (Option<String>, String) {
    match raw.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsltransform_xpath::DataSourceNode;

    #[test]
    fn parses_elements_attributes_and_text() {
        let doc = parse_document(r#"<a x="1"><b>hi</b><!--c--></a>"#).unwrap();
        let a = doc.root().children().next().unwrap();
        assert_eq!(a.local_name(), "a");
        assert_eq!(a.attributes().next().unwrap().string_value(), "1");
        let kids: Vec<_> = a.children().collect();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].local_name(), "b");
        assert_eq!(kids[0].string_value(), "hi");
    }

    #[test]
    fn parses_namespaced_elements() {
        let doc = parse_document(
            r#"<r xmlns:ex="urn:example"><ex:item/></r>"#,
        )
        .unwrap();
        let r = doc.root().children().next().unwrap();
        let item = r.children().next().unwrap();
        assert_eq!(item.prefix(), Some("ex"));
        assert_eq!(item.local_name(), "item");
    }

    #[test]
    fn empty_elements_self_close() {
        let doc = parse_document(r#"<a><b/><c/></a>"#).unwrap();
        let a = doc.root().children().next().unwrap();
        assert_eq!(a.children().count(), 2);
    }
}
