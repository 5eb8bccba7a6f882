//! The source node tree: an arena of nodes built from a stream of SAX-style
//! events, read-only once `TreeBuilder::finish` hands back a `Document`.
//!
//! Mirrors the `petty_xpath1`/`xsltransform_xpath` `DataSourceNode` contract
//! this engine's XPath evaluator is written against, the same way the
//! roxmltree-backed `XmlNode` in this codebase's earlier XSLT work did —
//! except nodes are arena indices rather than borrowed `roxmltree::Node`s, so
//! the tree can be built incrementally from streaming events instead of
//! requiring the whole document up front.
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use xsltransform_xpath::{DataSourceNode, NodeType, QName};

use crate::error::XsltError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element,
    Attribute,
    Text,
    Comment,
    ProcessingInstruction,
    Namespace,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    kind: NodeKind,
    prefix: Option<String>,
    local_name: String,
    value: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: Vec<NodeId>,
    namespaces: Vec<NodeId>,
    stripped: bool,
}

/// The arena backing a whole parsed source document. Indices handed out
/// while building are stable for the document's lifetime.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<NodeRecord>,
}

impl Document {
    pub fn root(&self) -> Node<'_> {
        Node {
            id: NodeId(0),
            doc: self,
        }
    }

    fn record(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.index()]
    }

    fn mark_stripped(&mut self, id: NodeId) {
        self.nodes[id.index()].stripped = true;
    }

    /// Drops whitespace-only text nodes whose parent element is selected by
    /// `should_strip` (and not overridden by a more specific preserve-space
    /// rule — that precedence is resolved by the caller before this is
    /// invoked; by the time `should_strip` runs, it already reflects the
    /// winning rule for that element name).
    pub fn strip_whitespace<F>(&mut self, should_strip: F)
    where
        F: Fn(Option<&str>, &str) -> bool,
    {
        let mut to_strip = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.kind != NodeKind::Text || !is_xml_whitespace(&node.value) {
                continue;
            }
            let Some(parent_id) = node.parent else {
                continue;
            };
            let parent = &self.nodes[parent_id.index()];
            if parent.kind == NodeKind::Element
                && should_strip(parent.prefix.as_deref(), &parent.local_name)
            {
                to_strip.push(NodeId(idx as u32));
            }
        }
        for id in to_strip {
            self.mark_stripped(id);
        }
    }
}

fn is_xml_whitespace(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '\u{9}' | '\u{A}' | '\u{D}' | '\u{20}'))
}

/// A handle into a [`Document`]'s arena. Cheap to copy; all navigation goes
/// back through the arena it was handed out by.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    id: NodeId,
    doc: &'a Document,
}

impl<'a> Node<'a> {
    fn record(&self) -> &'a NodeRecord {
        self.doc.record(self.id)
    }

    pub fn local_name(&self) -> &'a str {
        &self.record().local_name
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.record().prefix.as_deref()
    }

    pub fn raw_value(&self) -> &'a str {
        &self.record().value
    }

    pub fn document(&self) -> &'a Document {
        self.doc
    }
}

impl<'a> PartialEq for Node<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<'a> Eq for Node<'a> {}

impl<'a> PartialOrd for Node<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<'a> Ord for Node<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.0.cmp(&other.id.0)
    }
}
impl<'a> Hash for Node<'a> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<'a> DataSourceNode<'a> for Node<'a> {
    fn node_type(&self) -> NodeType {
        match self.record().kind {
            NodeKind::Root => NodeType::Root,
            NodeKind::Element => NodeType::Element,
            NodeKind::Attribute => NodeType::Attribute,
            NodeKind::Text => NodeType::Text,
            NodeKind::Comment => NodeType::Comment,
            NodeKind::ProcessingInstruction => NodeType::ProcessingInstruction,
            NodeKind::Namespace => NodeType::Namespace,
        }
    }

    fn name(&self) -> Option<QName<'a>> {
        let record = self.record();
        match record.kind {
            NodeKind::Element | NodeKind::Attribute | NodeKind::ProcessingInstruction => {
                Some(QName {
                    prefix: record.prefix.as_deref(),
                    local_part: &record.local_name,
                })
            }
            NodeKind::Namespace => Some(QName {
                prefix: None,
                local_part: &record.local_name,
            }),
            NodeKind::Root | NodeKind::Text | NodeKind::Comment => None,
        }
    }

    fn string_value(&self) -> String {
        let record = self.record();
        match record.kind {
            NodeKind::Text | NodeKind::Comment | NodeKind::ProcessingInstruction => {
                record.value.clone()
            }
            NodeKind::Attribute | NodeKind::Namespace => record.value.clone(),
            NodeKind::Root | NodeKind::Element => self.collect_descendant_text(),
        }
    }

    fn attributes(&self) -> Box<dyn Iterator<Item = Self> + 'a> {
        let doc = self.doc;
        let ids = self.record().attributes.clone();
        Box::new(ids.into_iter().map(move |id| Node { id, doc }))
    }

    fn namespaces(&self) -> Box<dyn Iterator<Item = Self> + 'a> {
        let doc = self.doc;
        let ids = self.record().namespaces.clone();
        Box::new(ids.into_iter().map(move |id| Node { id, doc }))
    }

    fn children(&self) -> Box<dyn Iterator<Item = Self> + 'a> {
        let doc = self.doc;
        let ids: Vec<NodeId> = self
            .record()
            .children
            .iter()
            .copied()
            .filter(|id| !doc.record(*id).stripped)
            .collect();
        Box::new(ids.into_iter().map(move |id| Node { id, doc }))
    }

    fn parent(&self) -> Option<Self> {
        self.record().parent.map(|id| Node { id, doc: self.doc })
    }
}

impl<'a> Node<'a> {
    fn collect_descendant_text(&self) -> String {
        let mut out = String::new();
        self.push_descendant_text(&mut out);
        out
    }

    fn push_descendant_text(&self, out: &mut String) {
        for child_id in &self.record().children {
            let child = Node {
                id: *child_id,
                doc: self.doc,
            };
            if child.record().stripped {
                continue;
            }
            match child.record().kind {
                NodeKind::Text => out.push_str(&child.record().value),
                NodeKind::Element => child.push_descendant_text(out),
                _ => {}
            }
        }
    }
}

/// Consumes the SAX-style event alphabet the node-tree builder contract
/// specifies and produces a `Document`. A driver (see `xml_events`) turns raw
/// bytes into calls against this type; the calls are also how a future
/// non-`quick-xml` event source could plug into the same tree.
pub struct TreeBuilder {
    doc: Document,
    open: Vec<NodeId>,
    in_scope_ns: Vec<Vec<NodeId>>,
    pending_ns: Vec<(Option<String>, String)>,
    text_buffer: String,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        let root = NodeRecord {
            kind: NodeKind::Root,
            prefix: None,
            local_name: String::new(),
            value: String::new(),
            parent: None,
            children: Vec::new(),
            attributes: Vec::new(),
            namespaces: Vec::new(),
            stripped: false,
        };
        TreeBuilder {
            doc: Document { nodes: vec![root] },
            open: vec![NodeId(0)],
            in_scope_ns: vec![Vec::new()],
            pending_ns: Vec::new(),
            text_buffer: String::new(),
        }
    }

    pub fn start_document(&mut self) {}

    pub fn end_document(&mut self) -> Result<(), XsltError> {
        self.flush_text();
        if self.open.len() != 1 {
            return Err(XsltError::TreeBuild(
                "end_document with unclosed elements".to_string(),
            ));
        }
        Ok(())
    }

    /// Buffers a `xmlns[:prefix]="uri"` declaration seen on the upcoming
    /// start-element's attribute list.
    pub fn start_prefix_mapping(&mut self, prefix: Option<String>, uri: String) {
        self.pending_ns.push((prefix, uri));
    }

    pub fn end_prefix_mapping(&mut self, _prefix: Option<&str>) {}

    fn push(&mut self, record: NodeRecord) -> NodeId {
        let id = NodeId(self.doc.nodes.len() as u32);
        self.doc.nodes.push(record);
        id
    }

    fn current(&self) -> NodeId {
        *self.open.last().expect("root is always open")
    }

    fn flush_text(&mut self) {
        if self.text_buffer.is_empty() {
            return;
        }
        let value = std::mem::take(&mut self.text_buffer);
        let parent = self.current();
        let id = self.push(NodeRecord {
            kind: NodeKind::Text,
            prefix: None,
            local_name: String::new(),
            value,
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
            namespaces: Vec::new(),
            stripped: false,
        });
        self.doc.nodes[parent.index()].children.push(id);
    }

    pub fn characters(&mut self, text: &str) {
        self.text_buffer.push_str(text);
    }

    pub fn ignorable_whitespace(&mut self, text: &str) {
        self.text_buffer.push_str(text);
    }

    /// `attrs` is `(prefix, local_name, value)` in source order, already
    /// stripped of any `xmlns`/`xmlns:*` declarations (those go through
    /// `start_prefix_mapping` instead).
    pub fn start_element(
        &mut self,
        prefix: Option<String>,
        local_name: String,
        attrs: Vec<(Option<String>, String, String)>,
    ) -> Result<(), XsltError> {
        self.flush_text();

        let mut in_scope = self.in_scope_ns.last().cloned().unwrap_or_default();
        let pending = std::mem::take(&mut self.pending_ns);
        for (ns_prefix, uri) in pending {
            let key = ns_prefix.clone().unwrap_or_default();
            in_scope.retain(|id| {
                let rec = &self.doc.nodes[id.index()];
                rec.local_name != key
            });
            let ns_id = self.push(NodeRecord {
                kind: NodeKind::Namespace,
                prefix: None,
                local_name: key,
                value: uri,
                parent: None,
                children: Vec::new(),
                attributes: Vec::new(),
                namespaces: Vec::new(),
                stripped: false,
            });
            in_scope.push(ns_id);
        }

        let parent = self.current();
        let element_id = self.push(NodeRecord {
            kind: NodeKind::Element,
            prefix,
            local_name,
            value: String::new(),
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
            namespaces: in_scope.clone(),
            stripped: false,
        });
        self.doc.nodes[parent.index()].children.push(element_id);

        let mut attribute_ids = Vec::with_capacity(attrs.len());
        for (attr_prefix, attr_local, attr_value) in attrs {
            let attr_id = self.push(NodeRecord {
                kind: NodeKind::Attribute,
                prefix: attr_prefix,
                local_name: attr_local,
                value: attr_value,
                parent: Some(element_id),
                children: Vec::new(),
                attributes: Vec::new(),
                namespaces: Vec::new(),
                stripped: false,
            });
            attribute_ids.push(attr_id);
        }
        self.doc.nodes[element_id.index()].attributes = attribute_ids;

        self.in_scope_ns.push(in_scope);
        self.open.push(element_id);
        Ok(())
    }

    pub fn end_element(&mut self) -> Result<(), XsltError> {
        self.flush_text();
        if self.open.len() <= 1 {
            return Err(XsltError::TreeBuild(
                "end_element without a matching start_element".to_string(),
            ));
        }
        self.open.pop();
        self.in_scope_ns.pop();
        Ok(())
    }

    pub fn comment(&mut self, text: &str) {
        self.flush_text();
        let parent = self.current();
        let id = self.push(NodeRecord {
            kind: NodeKind::Comment,
            prefix: None,
            local_name: String::new(),
            value: text.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
            namespaces: Vec::new(),
            stripped: false,
        });
        self.doc.nodes[parent.index()].children.push(id);
    }

    pub fn processing_instruction(&mut self, target: &str, data: &str) {
        self.flush_text();
        let parent = self.current();
        let id = self.push(NodeRecord {
            kind: NodeKind::ProcessingInstruction,
            prefix: None,
            local_name: target.to_string(),
            value: data.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
            namespaces: Vec::new(),
            stripped: false,
        });
        self.doc.nodes[parent.index()].children.push(id);
    }

    pub fn finish(self) -> Document {
        self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_doc() -> Document {
        let mut b = TreeBuilder::new();
        b.start_document();
        b.start_prefix_mapping(Some("ex".to_string()), "urn:example".to_string());
        b.start_element(
            None,
            "root".to_string(),
            vec![(None, "id".to_string(), "1".to_string())],
        )
        .unwrap();
        b.characters("  ");
        b.start_element(Some("ex".to_string()), "child".to_string(), vec![])
            .unwrap();
        b.characters("hello");
        b.end_element().unwrap();
        b.comment(" a comment ");
        b.end_element().unwrap();
        b.end_document().unwrap();
        b.finish()
    }

    #[test]
    fn builds_document_order_and_children() {
        let doc = simple_doc();
        let root_elem = doc.root().children().next().unwrap();
        assert_eq!(root_elem.local_name(), "root");
        assert_eq!(root_elem.attributes().count(), 1);
        let kids: Vec<_> = root_elem.children().collect();
        assert_eq!(kids.len(), 3); // whitespace text, child element, comment
        assert_eq!(kids[1].local_name(), "child");
        assert_eq!(kids[1].prefix(), Some("ex"));
    }

    #[test]
    fn string_value_concatenates_descendant_text() {
        let doc = simple_doc();
        let root_elem = doc.root().children().next().unwrap();
        assert_eq!(
            DataSourceNode::string_value(&root_elem),
            "  hello".to_string()
        );
    }

    #[test]
    fn namespace_axis_sees_declared_binding() {
        let doc = simple_doc();
        let root_elem = doc.root().children().next().unwrap();
        let child = root_elem.children().nth(1).unwrap();
        let ns: Vec<_> = child.namespaces().collect();
        assert!(ns.iter().any(|n| n.local_name() == "ex" && n.raw_value() == "urn:example"));
    }

    #[test]
    fn strip_whitespace_removes_matching_text_only() {
        let mut doc = simple_doc();
        doc.strip_whitespace(|_, local| local == "root");
        let root_elem = doc.root().children().next().unwrap();
        let kids: Vec<_> = root_elem.children().collect();
        assert_eq!(kids.len(), 2); // whitespace text node dropped
        assert_eq!(kids[0].local_name(), "child");
    }

    #[test]
    fn mismatched_end_element_is_an_error() {
        let mut b = TreeBuilder::new();
        assert!(b.end_element().is_err());
    }
}
