//! Typed node model
//!
//! One struct with the fields every node has, plus a closed `NodeKind`
//! payload. Dispatch is a `match`, not a class hierarchy.
//!
//! Nodes never point at each other. Parent, children, shadow roots and frame
//! content documents are `StableId`s resolved through the registry.

use crate::descriptor::NodeDescriptor;
use crate::error::Result;
use crate::types::{DomRect, FrameId, NodeType, ShadowRootType, StableId, VolatileId};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Capability set a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Kind {
    Document,
    Element,
    Text,
    Frame,
    Other,
}

impl Kind {
    /// Decide the variant for a descriptor
    pub fn of(desc: &NodeDescriptor, node_type: NodeType) -> Self {
        match node_type {
            NodeType::Document => Kind::Document,
            NodeType::Text => Kind::Text,
            NodeType::Element if desc.is_frame_owner() => Kind::Frame,
            NodeType::Element => Kind::Element,
            _ => Kind::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentData {
    pub document_url: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ElementData {
    pub tag_name: String,
    pub attributes: HashMap<String, String>,
    /// Bounding rect from the last content-quads fetch
    pub geometry: Option<DomRect>,
    /// Cached best-effort selector, cleared on attribute change
    pub selector_hint: Option<String>,
    pub distributed_nodes: SmallVec<[StableId; 2]>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TextData {
    pub text_value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameData {
    pub element: ElementData,
    pub frame_handle: Option<FrameId>,
    /// Root of the nested document, registered in the same registry
    pub content_document: Option<StableId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OtherData {
    pub node_value: String,
}

/// Kind-specific payload
#[derive(Debug, Clone, Serialize)]
pub enum NodeKind {
    Document(DocumentData),
    Element(ElementData),
    Text(TextData),
    Frame(FrameData),
    Other(OtherData),
}

/// Mirrored node
///
/// Updated in place for its whole lifetime; the registry never swaps the
/// instance behind a `StableId`.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorNode {
    pub stable_id: StableId,
    pub volatile_id: Option<VolatileId>,
    pub parent: Option<StableId>,
    pub children: SmallVec<[StableId; 4]>,
    pub shadow_roots: SmallVec<[StableId; 2]>,
    pub shadow_root_type: Option<ShadowRootType>,
    pub child_node_count: Option<u32>,
    pub node_type: NodeType,
    pub node_name: String,
    pub local_name: String,
    pub kind: NodeKind,
}

impl ElementData {
    fn from_descriptor(desc: &NodeDescriptor) -> Self {
        let mut data = Self {
            tag_name: tag_name_of(desc),
            ..Self::default()
        };
        data.apply(desc);
        data
    }

    fn apply(&mut self, desc: &NodeDescriptor) {
        self.tag_name = tag_name_of(desc);
        if desc.attributes.is_some() {
            self.attributes = desc
                .attribute_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.selector_hint = None;
        }
        if let Some(nodes) = &desc.distributed_nodes {
            self.distributed_nodes = nodes.iter().map(|n| n.backend_node_id).collect();
        }
    }
}

fn tag_name_of(desc: &NodeDescriptor) -> String {
    if desc.local_name.is_empty() {
        desc.node_name.to_ascii_lowercase()
    } else {
        desc.local_name.clone()
    }
}

impl NodeKind {
    fn from_descriptor(desc: &NodeDescriptor, kind: Kind) -> Self {
        match kind {
            Kind::Document => NodeKind::Document(DocumentData {
                document_url: desc.document_url.clone(),
                base_url: desc.base_url.clone(),
            }),
            Kind::Element => NodeKind::Element(ElementData::from_descriptor(desc)),
            Kind::Text => NodeKind::Text(TextData {
                text_value: desc.node_value.clone(),
            }),
            Kind::Frame => NodeKind::Frame(FrameData {
                element: ElementData::from_descriptor(desc),
                frame_handle: desc.frame_id.clone(),
                content_document: None,
            }),
            Kind::Other => NodeKind::Other(OtherData {
                node_value: desc.node_value.clone(),
            }),
        }
    }
}

impl MirrorNode {
    /// Build a detached node from a descriptor; links are set by the registry
    pub fn from_descriptor(desc: &NodeDescriptor) -> Result<Self> {
        let (stable_id, node_type) = desc.identity()?;
        let kind = Kind::of(desc, node_type);

        Ok(Self {
            stable_id,
            volatile_id: desc.volatile_id(),
            parent: None,
            children: SmallVec::new(),
            shadow_roots: SmallVec::new(),
            shadow_root_type: desc.shadow_root_type,
            child_node_count: desc.child_node_count,
            node_type,
            node_name: desc.node_name.clone(),
            local_name: desc.local_name.clone(),
            kind: NodeKind::from_descriptor(desc, kind),
        })
    }

    /// Re-apply a snapshot without changing identity
    ///
    /// Fields absent from the payload keep their current value, so a shallow
    /// describe never wipes attributes or links learned earlier. Children are
    /// relinked by the registry, not here.
    pub fn update(&mut self, desc: &NodeDescriptor) -> Result<()> {
        let (_, node_type) = desc.identity()?;
        let kind = Kind::of(desc, node_type);

        self.node_type = node_type;
        self.node_name = desc.node_name.clone();
        self.local_name = desc.local_name.clone();
        if let Some(volatile_id) = desc.volatile_id() {
            self.volatile_id = Some(volatile_id);
        }
        if desc.child_node_count.is_some() {
            self.child_node_count = desc.child_node_count;
        }
        if desc.shadow_root_type.is_some() {
            self.shadow_root_type = desc.shadow_root_type;
        }

        match (&mut self.kind, kind) {
            (NodeKind::Document(doc), Kind::Document) => {
                if desc.document_url.is_some() {
                    doc.document_url = desc.document_url.clone();
                }
                if desc.base_url.is_some() {
                    doc.base_url = desc.base_url.clone();
                }
            }
            (NodeKind::Element(el), Kind::Element) => el.apply(desc),
            (NodeKind::Frame(frame), Kind::Frame) => {
                frame.element.apply(desc);
                if desc.frame_id.is_some() {
                    frame.frame_handle = desc.frame_id.clone();
                }
            }
            // An element learned to be a frame owner: keep what we know
            (NodeKind::Element(el), Kind::Frame) => {
                let mut element = std::mem::take(el);
                element.apply(desc);
                self.kind = NodeKind::Frame(FrameData {
                    element,
                    frame_handle: desc.frame_id.clone(),
                    content_document: None,
                });
            }
            // Frame ownership is sticky; shallow payloads omit frameId
            (NodeKind::Frame(frame), Kind::Element) => frame.element.apply(desc),
            (NodeKind::Text(text), Kind::Text) => text.text_value = desc.node_value.clone(),
            (NodeKind::Other(other), Kind::Other) => other.node_value = desc.node_value.clone(),
            (_, kind) => self.kind = NodeKind::from_descriptor(desc, kind),
        }

        Ok(())
    }

    pub fn kind(&self) -> Kind {
        match self.kind {
            NodeKind::Document(_) => Kind::Document,
            NodeKind::Element(_) => Kind::Element,
            NodeKind::Text(_) => Kind::Text,
            NodeKind::Frame(_) => Kind::Frame,
            NodeKind::Other(_) => Kind::Other,
        }
    }

    /// Insert `child` before `before`, or append
    ///
    /// An existing occurrence of `child` is removed first, so a duplicate
    /// insert event moves the child instead of listing it twice.
    pub fn add_child(&mut self, child: StableId, before: Option<StableId>) {
        self.remove_child(child);
        let index = before
            .and_then(|b| self.children.iter().position(|&c| c == b))
            .unwrap_or(self.children.len());
        self.children.insert(index, child);
    }

    /// Remove `child`; returns whether it was present
    pub fn remove_child(&mut self, child: StableId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        self.children.len() != before
    }

    /// Element payload for elements and frame owners
    pub fn element(&self) -> Option<&ElementData> {
        match &self.kind {
            NodeKind::Element(el) => Some(el),
            NodeKind::Frame(frame) => Some(&frame.element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self) -> Option<&mut ElementData> {
        match &mut self.kind {
            NodeKind::Element(el) => Some(el),
            NodeKind::Frame(frame) => Some(&mut frame.element),
            _ => None,
        }
    }

    pub fn is_element(&self) -> bool {
        self.element().is_some()
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, NodeKind::Text(_))
    }

    /// Lowercase tag name for element nodes
    pub fn tag_name(&self) -> Option<&str> {
        self.element().map(|el| el.tag_name.as_str())
    }

    pub fn attributes(&self) -> Option<&HashMap<String, String>> {
        self.element().map(|el| &el.attributes)
    }

    /// Get attribute value
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element()
            .and_then(|el| el.attributes.get(name))
            .map(|s| s.as_str())
    }

    /// Set an attribute locally; returns the previous value
    ///
    /// Local state only. Forwarding a write to the remote side is the
    /// coordinator's job. Non-elements ignore the call.
    pub fn set_attribute(&mut self, name: &str, value: &str) -> Option<String> {
        let el = self.element_mut()?;
        el.selector_hint = None;
        el.attributes.insert(name.to_string(), value.to_string())
    }

    /// Remove an attribute locally; returns the removed value
    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let el = self.element_mut()?;
        let removed = el.attributes.remove(name);
        if removed.is_some() {
            el.selector_hint = None;
        }
        removed
    }

    /// Character data of text and other value-carrying nodes
    pub fn text_value(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Text(text) => Some(&text.text_value),
            NodeKind::Other(other) => Some(&other.node_value),
            _ => None,
        }
    }

    /// Replace character data; returns whether the node carries any
    pub fn set_text(&mut self, value: &str) -> bool {
        match &mut self.kind {
            NodeKind::Text(text) => text.text_value = value.to_string(),
            NodeKind::Other(other) => other.node_value = value.to_string(),
            _ => return false,
        }
        true
    }

    /// Nested document root for frame owners
    pub fn content_document(&self) -> Option<StableId> {
        match &self.kind {
            NodeKind::Frame(frame) => frame.content_document,
            _ => None,
        }
    }

    pub fn frame_handle(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Frame(frame) => frame.frame_handle.as_deref(),
            _ => None,
        }
    }

    pub fn document_url(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Document(doc) => doc.document_url.as_deref(),
            _ => None,
        }
    }

    /// Every id this node links to downward
    pub fn owned_ids(&self) -> impl Iterator<Item = StableId> + '_ {
        self.children
            .iter()
            .chain(self.shadow_roots.iter())
            .copied()
            .chain(self.content_document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desc(value: serde_json::Value) -> NodeDescriptor {
        serde_json::from_value(value).unwrap()
    }

    fn element(id: u32) -> MirrorNode {
        MirrorNode::from_descriptor(&desc(
            json!({"backendNodeId": id, "nodeType": 1, "nodeName": "UL"}),
        ))
        .unwrap()
    }

    #[test]
    fn test_variant_dispatch() {
        let cases = [
            (json!({"backendNodeId": 1, "nodeType": 9, "nodeName": "#document"}), Kind::Document),
            (json!({"backendNodeId": 2, "nodeType": 1, "nodeName": "DIV"}), Kind::Element),
            (json!({"backendNodeId": 3, "nodeType": 3, "nodeValue": "hi"}), Kind::Text),
            (json!({"backendNodeId": 4, "nodeType": 1, "nodeName": "IFRAME"}), Kind::Frame),
            (json!({"backendNodeId": 5, "nodeType": 8, "nodeValue": "note"}), Kind::Other),
            (json!({"backendNodeId": 6, "nodeType": 11, "nodeName": "#document-fragment"}), Kind::Other),
        ];
        for (value, expected) in cases {
            let node = MirrorNode::from_descriptor(&desc(value)).unwrap();
            assert_eq!(node.kind(), expected, "{:?}", node.node_name);
        }
    }

    #[test]
    fn test_add_child_order() {
        let mut parent = element(1);
        parent.add_child(StableId(10), None);
        parent.add_child(StableId(30), None);
        parent.add_child(StableId(20), Some(StableId(30)));
        assert_eq!(
            parent.children.as_slice(),
            &[StableId(10), StableId(20), StableId(30)]
        );

        // Unknown "before" appends
        parent.add_child(StableId(40), Some(StableId(99)));
        assert_eq!(parent.children.last(), Some(&StableId(40)));
    }

    #[test]
    fn test_duplicate_insert_moves_child() {
        let mut parent = element(1);
        parent.add_child(StableId(10), None);
        parent.add_child(StableId(20), None);
        parent.add_child(StableId(10), None);
        assert_eq!(parent.children.as_slice(), &[StableId(20), StableId(10)]);
        assert!(parent.remove_child(StableId(10)));
        assert!(!parent.remove_child(StableId(10)));
    }

    #[test]
    fn test_update_keeps_unmentioned_fields() {
        let mut node = MirrorNode::from_descriptor(&desc(json!({
            "nodeId": 4, "backendNodeId": 2, "nodeType": 1, "nodeName": "DIV",
            "localName": "div", "attributes": ["id", "a"], "childNodeCount": 3
        })))
        .unwrap();

        node.update(&desc(json!({
            "nodeId": 9, "backendNodeId": 2, "nodeType": 1, "nodeName": "DIV", "localName": "div"
        })))
        .unwrap();

        assert_eq!(node.volatile_id, Some(VolatileId(9)));
        assert_eq!(node.attr("id"), Some("a"));
        assert_eq!(node.child_node_count, Some(3));
    }

    #[test]
    fn test_element_becomes_frame() {
        let mut node = MirrorNode::from_descriptor(&desc(json!({
            "backendNodeId": 2, "nodeType": 1, "nodeName": "OBJECT", "attributes": ["data", "x"]
        })))
        .unwrap();
        assert_eq!(node.kind(), Kind::Element);

        node.update(&desc(json!({
            "backendNodeId": 2, "nodeType": 1, "nodeName": "OBJECT", "frameId": "F9"
        })))
        .unwrap();
        assert_eq!(node.kind(), Kind::Frame);
        assert_eq!(node.frame_handle(), Some("F9"));
        assert_eq!(node.attr("data"), Some("x"));
    }

    #[test]
    fn test_attribute_and_text_helpers() {
        let mut el = element(1);
        assert_eq!(el.set_attribute("class", "a"), None);
        assert_eq!(el.set_attribute("class", "b"), Some("a".to_string()));
        assert_eq!(el.remove_attribute("class"), Some("b".to_string()));
        assert!(!el.set_text("x"));

        let mut text =
            MirrorNode::from_descriptor(&desc(json!({"backendNodeId": 2, "nodeType": 3, "nodeValue": "a"})))
                .unwrap();
        assert!(text.set_text("b"));
        assert_eq!(text.text_value(), Some("b"));
        assert_eq!(text.set_attribute("id", "x"), None);
        assert!(text.attributes().is_none());
    }
}
