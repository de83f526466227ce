//! Canonical XML 1.0 and Exclusive Canonical XML 1.0 over a [`Document`] subtree.

use std::collections::BTreeMap;

use super::{Document, NodeId, NodeKind};

pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_WITH_COMMENTS: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Inclusive {
        with_comments: bool,
    },
    Exclusive {
        with_comments: bool,
        /// Prefixes handled inclusively; "#default" in the source list maps to "".
        inclusive_prefixes: Vec<String>,
    },
}

impl Algorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            C14N => Some(Algorithm::Inclusive { with_comments: false }),
            C14N_WITH_COMMENTS => Some(Algorithm::Inclusive { with_comments: true }),
            EXC_C14N => Some(Algorithm::Exclusive {
                with_comments: false,
                inclusive_prefixes: Vec::new(),
            }),
            EXC_C14N_WITH_COMMENTS => Some(Algorithm::Exclusive {
                with_comments: true,
                inclusive_prefixes: Vec::new(),
            }),
            _ => None,
        }
    }

    /// Apply an `InclusiveNamespaces PrefixList` value. No effect on inclusive c14n.
    pub fn with_prefix_list(self, list: &str) -> Self {
        match self {
            Algorithm::Exclusive { with_comments, .. } => Algorithm::Exclusive {
                with_comments,
                inclusive_prefixes: list
                    .split_whitespace()
                    .map(|p| if p == "#default" { String::new() } else { p.to_string() })
                    .collect(),
            },
            inclusive => inclusive,
        }
    }

    fn with_comments(&self) -> bool {
        match self {
            Algorithm::Inclusive { with_comments } => *with_comments,
            Algorithm::Exclusive { with_comments, .. } => *with_comments,
        }
    }
}

/// Canonicalize the subtree rooted at `apex`, leaving out `exclude` and everything below it.
pub fn canonicalize(
    doc: &Document,
    apex: NodeId,
    exclude: Option<NodeId>,
    algorithm: &Algorithm,
) -> String {
    let mut writer = Canonicalizer {
        doc,
        exclude,
        algorithm,
        out: String::new(),
    };
    writer.node(apex, &BTreeMap::new());
    writer.out
}

struct Canonicalizer<'a> {
    doc: &'a Document,
    exclude: Option<NodeId>,
    algorithm: &'a Algorithm,
    out: String,
}

impl Canonicalizer<'_> {
    /// `rendered` holds the namespace bindings emitted by output ancestors.
    fn node(&mut self, id: NodeId, rendered: &BTreeMap<String, String>) {
        if self.exclude == Some(id) {
            return;
        }

        let doc = self.doc;
        match &doc.node(id).kind {
            NodeKind::Text(text) => escape_text(text, &mut self.out),
            NodeKind::Comment(text) => {
                if self.algorithm.with_comments() {
                    self.out.push_str("<!--");
                    self.out.push_str(text);
                    self.out.push_str("-->");
                }
            }
            NodeKind::ProcessingInstruction { target, data } => {
                self.out.push_str("<?");
                self.out.push_str(target);
                if !data.is_empty() {
                    self.out.push(' ');
                    self.out.push_str(data);
                }
                self.out.push_str("?>");
            }
            NodeKind::Element(element) => {
                let name = element.qualified_name();
                let declarations = self.namespace_declarations(id, rendered);

                self.out.push('<');
                self.out.push_str(&name);

                let mut in_effect = rendered.clone();
                for (prefix, uri) in &declarations {
                    if prefix.is_empty() {
                        self.out.push_str(" xmlns=\"");
                    } else {
                        self.out.push_str(" xmlns:");
                        self.out.push_str(prefix);
                        self.out.push_str("=\"");
                    }
                    escape_attribute(uri, &mut self.out);
                    self.out.push('"');
                    in_effect.insert(prefix.clone(), uri.clone());
                }

                let mut attributes: Vec<(&str, &str, String, &str)> = element
                    .attributes
                    .iter()
                    .map(|a| {
                        let ns = a
                            .prefix
                            .as_deref()
                            .and_then(|p| doc.lookup_namespace(id, p))
                            .unwrap_or("");
                        (ns, a.local_name.as_str(), a.qualified_name(), a.value.as_str())
                    })
                    .collect();
                attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

                for (_, _, qualified, value) in attributes {
                    self.out.push(' ');
                    self.out.push_str(&qualified);
                    self.out.push_str("=\"");
                    escape_attribute(value, &mut self.out);
                    self.out.push('"');
                }
                self.out.push('>');

                for &child in &element.children {
                    self.node(child, &in_effect);
                }

                self.out.push_str("</");
                self.out.push_str(&name);
                self.out.push('>');
            }
        }
    }

    /// Namespace declarations to emit on element `id`, sorted by prefix.
    fn namespace_declarations(
        &self,
        id: NodeId,
        rendered: &BTreeMap<String, String>,
    ) -> Vec<(String, String)> {
        let in_scope = self.doc.in_scope_namespaces(id);

        let candidates: Vec<String> = match self.algorithm {
            Algorithm::Inclusive { .. } => in_scope.keys().cloned().collect(),
            Algorithm::Exclusive {
                inclusive_prefixes, ..
            } => {
                let mut used = Vec::new();
                if let Some(element) = self.doc.element(id) {
                    used.push(element.prefix.clone().unwrap_or_default());
                    used.extend(element.attributes.iter().filter_map(|a| a.prefix.clone()));
                }
                used.extend(
                    inclusive_prefixes
                        .iter()
                        .filter(|p| in_scope.contains_key(*p))
                        .cloned(),
                );
                used
            }
        };

        let mut declarations = BTreeMap::new();
        for prefix in candidates {
            if prefix == "xml" {
                continue;
            }
            let uri = in_scope.get(&prefix).cloned().unwrap_or_default();
            let already = rendered.get(&prefix);
            let emit = if uri.is_empty() {
                // an empty default only undoes a non-empty one emitted above
                prefix.is_empty() && already.is_some_and(|u| !u.is_empty())
            } else {
                already != Some(&uri)
            };
            if emit {
                declarations.insert(prefix, uri);
            }
        }
        declarations.into_iter().collect()
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}
