//! Serializer - walk the live mirror into an ownership-free snapshot
//!
//! The output owns all its data and holds no ids, so it is the only form of
//! the mirror safe to hand across a thread, process or UI boundary.
//!
//! ```text
//! element / frame -> {"tag": "div", "attributes": {...}, "children": [...]}
//! text            -> "raw string"
//! document        -> {"tag": "#document", "children": [...]}
//! ```

use crate::node::{MirrorNode, NodeKind};
use crate::registry::NodeRegistry;
use crate::types::StableId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializerConfig {
    /// Descend into frame content documents
    pub follow_frames: bool,
    /// Emit shadow roots as `#shadow-root` children ahead of light children
    pub include_shadow_roots: bool,
    /// Emit comments, doctypes and other non-element nodes as `{tag}`
    pub include_other: bool,
    /// Truncate text nodes longer than this (bytes); `None` keeps all
    pub max_text_length: Option<usize>,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            follow_frames: true,
            include_shadow_roots: false,
            include_other: true,
            max_text_length: None,
        }
    }
}

/// Plain nested snapshot of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedNode {
    Text(String),
    Element(SerializedElement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedElement {
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedNode>,
}

impl SerializedElement {
    fn leaf(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }
}

/// Mirror tree serializer
pub struct DomSerializer {
    config: SerializerConfig,
}

/// Pending element output: children still to be visited
struct Pending {
    element: SerializedElement,
    pending: std::vec::IntoIter<StableId>,
}

impl DomSerializer {
    pub fn new() -> Self {
        Self::with_config(SerializerConfig::default())
    }

    pub fn with_config(config: SerializerConfig) -> Self {
        Self { config }
    }

    /// Serialize the subtree rooted at `id`; `None` if it is not registered
    ///
    /// Iterative walk with an explicit stack; ids the registry does not know
    /// (a gap mid-event) are skipped.
    pub fn serialize(&self, registry: &NodeRegistry, id: StableId) -> Option<SerializedNode> {
        let node = registry.by_stable_id(id)?;
        let (value, children) = self.open(node)?;
        let Some(element) = value else {
            return Some(SerializedNode::Text(self.text(node)));
        };

        let mut stack = vec![Pending {
            element,
            pending: children.into_iter(),
        }];

        loop {
            let Some(top) = stack.last_mut() else {
                return None;
            };
            match top.pending.next() {
                Some(child_id) => {
                    let Some(child) = registry.by_stable_id(child_id) else {
                        continue;
                    };
                    let Some((value, children)) = self.open(child) else {
                        continue;
                    };
                    match value {
                        Some(element) => stack.push(Pending {
                            element,
                            pending: children.into_iter(),
                        }),
                        None => top.element.children.push(SerializedNode::Text(self.text(child))),
                    }
                }
                None => {
                    let Some(done) = stack.pop() else {
                        return None;
                    };
                    let done = SerializedNode::Element(done.element);
                    match stack.last_mut() {
                        Some(parent) => parent.element.children.push(done),
                        None => return Some(done),
                    }
                }
            }
        }
    }

    /// Serialize from the registry's document root
    pub fn serialize_root(&self, registry: &NodeRegistry) -> Option<SerializedNode> {
        self.serialize(registry, registry.root_id()?)
    }

    /// Serialize to a JSON string
    pub fn to_json(&self, registry: &NodeRegistry) -> serde_json::Result<String> {
        serde_json::to_string(&self.serialize_root(registry))
    }

    /// Output shell for a node plus the ids to visit under it
    ///
    /// `None` skips the node; `Some((None, _))` marks a text leaf.
    fn open(&self, node: &MirrorNode) -> Option<(Option<SerializedElement>, Vec<StableId>)> {
        let mut ids = Vec::new();
        if self.config.include_shadow_roots {
            ids.extend(node.shadow_roots.iter().copied());
        }

        let element = match &node.kind {
            NodeKind::Text(_) => return Some((None, Vec::new())),
            NodeKind::Document(_) => {
                let tag = if node.node_name.is_empty() {
                    "#document"
                } else {
                    node.node_name.as_str()
                };
                SerializedElement::leaf(tag)
            }
            NodeKind::Element(el) => SerializedElement {
                tag: el.tag_name.clone(),
                attributes: el.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                children: Vec::new(),
            },
            NodeKind::Frame(frame) => {
                if self.config.follow_frames {
                    ids.extend(frame.content_document);
                }
                SerializedElement {
                    tag: frame.element.tag_name.clone(),
                    attributes: frame
                        .element
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    children: Vec::new(),
                }
            }
            NodeKind::Other(_) if !self.config.include_other => return None,
            NodeKind::Other(_) if node.shadow_root_type.is_some() => {
                SerializedElement::leaf("#shadow-root")
            }
            NodeKind::Other(_) => SerializedElement::leaf(node.node_name.to_ascii_lowercase()),
        };

        ids.extend(node.children.iter().copied());
        Some((Some(element), ids))
    }

    fn text(&self, node: &MirrorNode) -> String {
        let text = node.text_value().unwrap_or_default();
        match self.config.max_text_length {
            Some(max) if text.len() > max => {
                let mut end = max;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &text[..end])
            }
            _ => text.to_string(),
        }
    }
}

impl Default for DomSerializer {
    fn default() -> Self {
        Self::new()
    }
}
