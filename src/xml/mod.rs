//! Minimal namespace-aware XML tree.
//!
//! SAML verification needs things a streaming reader cannot give directly:
//! the parent of a signature, in-scope namespaces for canonicalization and
//! lookups by ID. Documents are small, so they are parsed once into an
//! arena of nodes addressed by index.

pub mod c14n;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;

/// Namespace bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("document type declarations are not allowed")]
    DoctypeNotAllowed,

    #[error("namespace prefix '{0}' is not bound")]
    UnboundPrefix(String),

    #[error("document has no root element")]
    NoRoot,

    #[error("document has more than one root element")]
    MultipleRoots,
}

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub prefix: Option<String>,
    pub local_name: String,
    /// Declarations made on this element; the default namespace uses "".
    pub namespaces: Vec<(String, String)>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<NodeId>,
}

impl Element {
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.local_name),
            None => self.local_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local_name: String,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.local_name),
            None => self.local_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

fn parse_err<E: std::fmt::Display>(err: E) -> XmlError {
    XmlError::Parse(err.to_string())
}

fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(parse_err)
}

/// Line-ending normalization an XML processor performs before parsing.
fn normalize_line_endings(xml: &str) -> String {
    xml.replace("\r\n", "\n").replace('\r', "\n")
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let normalized = normalize_line_endings(xml.trim_start_matches('\u{feff}'));
        let mut reader = Reader::from_str(&normalized);
        reader.config_mut().trim_text(false);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut root: Option<NodeId> = None;

        loop {
            match reader.read_event().map_err(parse_err)? {
                Event::Start(e) => {
                    let id = push_element(&mut nodes, &stack, &mut root, &e)?;
                    stack.push(id);
                }
                Event::Empty(e) => {
                    push_element(&mut nodes, &stack, &mut root, &e)?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) => {
                    if let Some(&parent) = stack.last() {
                        let text = t.unescape().map_err(parse_err)?.into_owned();
                        push_child(&mut nodes, parent, NodeKind::Text(text));
                    }
                }
                Event::CData(c) => {
                    if let Some(&parent) = stack.last() {
                        let text = utf8(&c)?.to_string();
                        push_child(&mut nodes, parent, NodeKind::Text(text));
                    }
                }
                Event::Comment(c) => {
                    if let Some(&parent) = stack.last() {
                        let text = utf8(&c)?.to_string();
                        push_child(&mut nodes, parent, NodeKind::Comment(text));
                    }
                }
                Event::PI(p) => {
                    if let Some(&parent) = stack.last() {
                        let target = utf8(p.target())?.to_string();
                        let data = utf8(p.content())?.trim_start().to_string();
                        push_child(
                            &mut nodes,
                            parent,
                            NodeKind::ProcessingInstruction { target, data },
                        );
                    }
                }
                Event::DocType(_) => return Err(XmlError::DoctypeNotAllowed),
                Event::Decl(_) => {}
                Event::Eof => {
                    if !stack.is_empty() {
                        return Err(XmlError::Parse("unexpected end of document".to_string()));
                    }
                    break;
                }
            }
        }

        let root = root.ok_or(XmlError::NoRoot)?;
        let doc = Document { nodes, root };
        doc.check_prefixes()?;
        Ok(doc)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id)?.parent
    }

    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|e| e.local_name.as_str())
    }

    /// Child elements of `id`, in document order.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.element(id)
            .map(|e| e.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(move |&c| self.element(c).is_some())
    }

    pub fn child(&self, id: NodeId, local_name: &str) -> Option<NodeId> {
        self.child_elements(id)
            .find(|&c| self.local_name(c) == Some(local_name))
    }

    /// `id` and every element below it, in document order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(element) = self.element(next) {
                out.push(next);
                pending.extend(element.children.iter().rev().copied());
            }
        }
        out
    }

    /// Elements at or below `id` with the given local name, in document order.
    pub fn find_all(&self, id: NodeId, local_name: &str) -> Vec<NodeId> {
        self.descendants(id)
            .into_iter()
            .filter(|&n| self.local_name(n) == Some(local_name))
            .collect()
    }

    pub fn find_first(&self, id: NodeId, local_name: &str) -> Option<NodeId> {
        self.descendants(id)
            .into_iter()
            .find(|&n| self.local_name(n) == Some(local_name))
    }

    /// Follow a path of child local names from `id`.
    pub fn path(&self, id: NodeId, names: &[&str]) -> Option<NodeId> {
        names
            .iter()
            .try_fold(id, |current, name| self.child(current, name))
    }

    /// Unprefixed attribute value.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?
            .attributes
            .iter()
            .find(|a| a.prefix.is_none() && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    /// Concatenated text of every descendant text node.
    pub fn text(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Element(element) => {
                for &child in &element.children {
                    self.collect_text(child, out);
                }
            }
            _ => {}
        }
    }

    pub fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.parent(node) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Namespace URI bound to `prefix` ("" for the default) at element `id`.
    pub fn lookup_namespace(&self, id: NodeId, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(element) = self.element(node) {
                if let Some((_, uri)) = element.namespaces.iter().find(|(p, _)| p == prefix) {
                    return Some(uri.as_str());
                }
            }
            current = self.parent(node);
        }
        None
    }

    /// Namespace URI of element `id` itself.
    pub fn namespace_uri(&self, id: NodeId) -> Option<&str> {
        let element = self.element(id)?;
        let uri = self.lookup_namespace(id, element.prefix.as_deref().unwrap_or(""))?;
        (!uri.is_empty()).then_some(uri)
    }

    /// Every namespace binding in scope at `id`, nearest declaration winning.
    pub fn in_scope_namespaces(&self, id: NodeId) -> BTreeMap<String, String> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            chain.push(node);
            current = self.parent(node);
        }

        let mut scope = BTreeMap::new();
        for node in chain.into_iter().rev() {
            if let Some(element) = self.element(node) {
                for (prefix, uri) in &element.namespaces {
                    scope.insert(prefix.clone(), uri.clone());
                }
            }
        }
        scope
    }

    /// Elements carrying an ID-typed attribute equal to `value`.
    pub fn elements_with_id(&self, value: &str) -> Vec<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .filter(|&n| {
                ID_ATTRIBUTES
                    .iter()
                    .any(|name| self.attribute(n, name) == Some(value))
            })
            .collect()
    }

    fn check_prefixes(&self) -> Result<(), XmlError> {
        for id in self.descendants(self.root) {
            let Some(element) = self.element(id) else {
                continue;
            };
            let prefixes = element
                .prefix
                .iter()
                .chain(element.attributes.iter().filter_map(|a| a.prefix.as_ref()));
            for prefix in prefixes {
                if self.lookup_namespace(id, prefix).is_none() {
                    return Err(XmlError::UnboundPrefix(prefix.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Attribute names treated as element IDs.
pub const ID_ATTRIBUTES: &[&str] = &["ID", "Id", "AssertionID"];

fn push_child(nodes: &mut Vec<Node>, parent: NodeId, kind: NodeKind) -> NodeId {
    let id = nodes.len();
    nodes.push(Node {
        parent: Some(parent),
        kind,
    });
    if let NodeKind::Element(element) = &mut nodes[parent].kind {
        element.children.push(id);
    }
    id
}

fn push_element(
    nodes: &mut Vec<Node>,
    stack: &[NodeId],
    root: &mut Option<NodeId>,
    start: &BytesStart,
) -> Result<NodeId, XmlError> {
    let element = parse_start(start)?;
    match stack.last() {
        Some(&parent) => Ok(push_child(nodes, parent, NodeKind::Element(element))),
        None => {
            if root.is_some() {
                return Err(XmlError::MultipleRoots);
            }
            let id = nodes.len();
            nodes.push(Node {
                parent: None,
                kind: NodeKind::Element(element),
            });
            *root = Some(id);
            Ok(id)
        }
    }
}

fn split_name(name: &[u8]) -> Result<(Option<String>, String), XmlError> {
    let name = utf8(name)?;
    Ok(match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    })
}

/// Attribute-value normalization: literal whitespace characters become spaces.
fn normalize_attribute(raw: &str) -> String {
    raw.chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect()
}

fn parse_start(start: &BytesStart) -> Result<Element, XmlError> {
    let (prefix, local_name) = split_name(start.name().as_ref())?;
    let mut element = Element {
        prefix,
        local_name,
        ..Default::default()
    };

    for attr in start.attributes() {
        let attr = attr.map_err(parse_err)?;
        let raw = normalize_attribute(utf8(&attr.value)?);
        let value = quick_xml::escape::unescape(&raw)
            .map_err(parse_err)?
            .into_owned();

        match split_name(attr.key.as_ref())? {
            (None, name) if name == "xmlns" => element.namespaces.push((String::new(), value)),
            (Some(p), name) if p == "xmlns" => element.namespaces.push((name, value)),
            (prefix, local_name) => element.attributes.push(Attribute {
                prefix,
                local_name,
                value,
            }),
        }
    }

    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r1">
  <saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">https://idp &amp; co</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <!-- note -->
  <Plain attr="a&#10;b	c"><![CDATA[<raw>]]></Plain>
</samlp:Response>"#;

    #[test]
    fn test_parse_tree() {
        let doc = Document::parse(SAMPLE).unwrap();
        let root = doc.root();
        assert_eq!(doc.local_name(root), Some("Response"));
        assert_eq!(
            doc.namespace_uri(root),
            Some("urn:oasis:names:tc:SAML:2.0:protocol")
        );
        assert_eq!(doc.child_elements(root).count(), 3);

        let issuer = doc.child(root, "Issuer").unwrap();
        assert_eq!(doc.text(issuer), "https://idp & co");
        assert_eq!(
            doc.namespace_uri(issuer),
            Some("urn:oasis:names:tc:SAML:2.0:assertion")
        );

        let code = doc.path(root, &["Status", "StatusCode"]).unwrap();
        assert_eq!(
            doc.attribute(code, "Value"),
            Some("urn:oasis:names:tc:SAML:2.0:status:Success")
        );
    }

    #[test]
    fn test_attribute_normalization_and_cdata() {
        let doc = Document::parse(SAMPLE).unwrap();
        let plain = doc.find_first(doc.root(), "Plain").unwrap();
        // character reference survives, literal tab becomes a space
        assert_eq!(doc.attribute(plain, "attr"), Some("a\nb c"));
        assert_eq!(doc.text(plain), "<raw>");
        assert_eq!(doc.namespace_uri(plain), None);
    }

    #[test]
    fn test_descendants_in_document_order() {
        let doc = Document::parse("<a><b><c/></b><d/></a>").unwrap();
        let names: Vec<_> = doc
            .descendants(doc.root())
            .into_iter()
            .filter_map(|n| doc.local_name(n))
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_in_scope_namespaces() {
        let doc = Document::parse(
            r#"<a xmlns="urn:default" xmlns:x="urn:x"><b xmlns:x="urn:x2" xmlns="" /></a>"#,
        )
        .unwrap();
        let b = doc.child(doc.root(), "b").unwrap();
        let scope = doc.in_scope_namespaces(b);
        assert_eq!(scope.get("x").map(String::as_str), Some("urn:x2"));
        assert_eq!(scope.get("").map(String::as_str), Some(""));
        assert_eq!(doc.namespace_uri(b), None);
    }

    #[test]
    fn test_elements_with_id() {
        let doc = Document::parse(r#"<a ID="one"><b Id="two"/><c AssertionID="two"/></a>"#)
            .unwrap();
        assert_eq!(doc.elements_with_id("one"), vec![doc.root()]);
        assert_eq!(doc.elements_with_id("two").len(), 2);
        assert!(doc.elements_with_id("three").is_empty());
    }

    #[test]
    fn test_rejects_doctype() {
        let xml = r#"<!DOCTYPE a [<!ENTITY x "y">]><a>&x;</a>"#;
        assert!(matches!(Document::parse(xml), Err(XmlError::DoctypeNotAllowed)));
    }

    #[test]
    fn test_rejects_unbound_prefix() {
        assert!(matches!(
            Document::parse("<p:a/>"),
            Err(XmlError::UnboundPrefix(_))
        ));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("<a><b/>").is_err());
        assert!(matches!(Document::parse("   "), Err(XmlError::NoRoot)));
    }

    #[test]
    fn test_normalizes_line_endings() {
        let doc = Document::parse("<a>x\r\ny\rz</a>").unwrap();
        assert_eq!(doc.text(doc.root()), "x\ny\nz");
    }
}
