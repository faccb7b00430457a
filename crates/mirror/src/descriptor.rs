//! CDP `DOM.Node` wire shape
//!
//! Parsed exactly as the protocol defines it. Validation of the two fields
//! the mirror cannot live without (`backendNodeId`, `nodeType`) happens here,
//! so a protocol mismatch surfaces as `MalformedDescriptor` at the boundary.

use crate::error::{DomError, Result};
use crate::types::{FrameId, NodeType, ShadowRootType, StableId, VolatileId};
use serde::{Deserialize, Serialize};

/// Node snapshot as delivered by `DOM.getDocument`, `DOM.describeNode` and
/// the structural `DOM.*` events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    #[serde(rename = "nodeId", alias = "volatileId", default)]
    pub node_id: Option<u32>,
    #[serde(rename = "backendNodeId", alias = "stableId", default)]
    pub backend_node_id: Option<u32>,
    #[serde(default)]
    pub node_type: Option<u8>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub node_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_node_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<NodeDescriptor>>,
    /// Flat alternating `[name, value, name, value, ...]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_document: Option<Box<NodeDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_roots: Option<Vec<NodeDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_root_type: Option<ShadowRootType>,
    #[serde(rename = "documentURL", default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    #[serde(rename = "baseURL", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_nodes: Option<Vec<BackendNode>>,
}

/// Lightweight node reference (`DOM.BackendNode`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendNode {
    pub node_type: u8,
    pub node_name: String,
    pub backend_node_id: StableId,
}

impl NodeDescriptor {
    /// Stable identity; absent means the payload is unusable
    pub fn stable_id(&self) -> Result<StableId> {
        self.backend_node_id.map(StableId).ok_or_else(|| {
            DomError::MalformedDescriptor(format!(
                "missing backendNodeId on {:?} (nodeId {:?})",
                self.node_name, self.node_id
            ))
        })
    }

    /// Volatile handle, if the remote side assigned one
    pub fn volatile_id(&self) -> Option<VolatileId> {
        self.node_id.filter(|&id| id != 0).map(VolatileId)
    }

    pub fn node_type(&self) -> Result<NodeType> {
        let raw = self.node_type.ok_or_else(|| {
            DomError::MalformedDescriptor(format!(
                "missing nodeType on backendNodeId {:?}",
                self.backend_node_id
            ))
        })?;
        NodeType::from_u8(raw)
            .ok_or_else(|| DomError::MalformedDescriptor(format!("unknown nodeType {}", raw)))
    }

    /// Validate the identity fields in one step
    pub fn identity(&self) -> Result<(StableId, NodeType)> {
        Ok((self.stable_id()?, self.node_type()?))
    }

    /// Pair the flat attribute list; a trailing name without value is dropped
    pub fn attribute_pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.attributes
            .iter()
            .flat_map(|attrs| attrs.chunks_exact(2))
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
    }

    /// Element names that host a nested browsing context
    pub fn is_frame_owner(&self) -> bool {
        self.content_document.is_some()
            || (self.frame_id.is_some() && self.node_type == Some(NodeType::Element as u8))
            || self.node_name.eq_ignore_ascii_case("iframe")
            || self.node_name.eq_ignore_ascii_case("frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_cdp_node() {
        let desc: NodeDescriptor = serde_json::from_value(json!({
            "nodeId": 5,
            "backendNodeId": 17,
            "nodeType": 1,
            "nodeName": "IFRAME",
            "localName": "iframe",
            "nodeValue": "",
            "parentId": 4,
            "childNodeCount": 0,
            "attributes": ["src", "/inner.html", "id", "f"],
            "frameId": "F1",
            "contentDocument": {
                "nodeId": 6,
                "backendNodeId": 18,
                "nodeType": 9,
                "nodeName": "#document",
                "localName": "",
                "nodeValue": "",
                "documentURL": "https://example.com/inner.html"
            }
        }))
        .unwrap();

        assert_eq!(desc.identity().unwrap(), (StableId(17), NodeType::Element));
        assert_eq!(desc.volatile_id(), Some(VolatileId(5)));
        assert!(desc.is_frame_owner());
        let attrs: Vec<_> = desc.attribute_pairs().collect();
        assert_eq!(attrs, vec![("src", "/inner.html"), ("id", "f")]);
        let doc = desc.content_document.as_ref().unwrap();
        assert_eq!(
            doc.document_url.as_deref(),
            Some("https://example.com/inner.html")
        );
    }

    #[test]
    fn test_abstract_aliases() {
        let desc: NodeDescriptor =
            serde_json::from_value(json!({"stableId": 1, "volatileId": 0, "nodeType": 9}))
                .unwrap();
        assert_eq!(desc.stable_id().unwrap(), StableId(1));
        assert_eq!(desc.volatile_id(), None);
    }

    #[test]
    fn test_missing_identity_is_malformed() {
        let desc: NodeDescriptor =
            serde_json::from_value(json!({"nodeId": 3, "nodeType": 1, "nodeName": "DIV"}))
                .unwrap();
        assert!(matches!(
            desc.identity(),
            Err(DomError::MalformedDescriptor(_))
        ));

        let desc: NodeDescriptor =
            serde_json::from_value(json!({"backendNodeId": 3, "nodeName": "DIV"})).unwrap();
        assert!(matches!(
            desc.node_type(),
            Err(DomError::MalformedDescriptor(_))
        ));

        let desc: NodeDescriptor =
            serde_json::from_value(json!({"backendNodeId": 3, "nodeType": 42})).unwrap();
        assert!(desc.node_type().is_err());
    }

    #[test]
    fn test_odd_attribute_list() {
        let desc: NodeDescriptor = serde_json::from_value(
            json!({"backendNodeId": 3, "nodeType": 1, "attributes": ["a", "1", "dangling"]}),
        )
        .unwrap();
        assert_eq!(desc.attribute_pairs().count(), 1);
    }
}
