//! Inbound `DOM.*` protocol events and outbound mirror notifications
//!
//! Inbound events carry volatile ids; outbound updates carry stable ids only,
//! so a consumer can hold on to anything it is told about.

use crate::descriptor::{BackendNode, NodeDescriptor};
use crate::error::{DomError, Result};
use crate::types::{StableId, VolatileId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural, attribute and text mutation events the mirror applies
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    /// Whole document invalidated (navigation or equivalent)
    DocumentUpdated,
    /// Children of `parent_id` delivered in full
    SetChildNodes {
        parent_id: VolatileId,
        nodes: Vec<NodeDescriptor>,
    },
    /// `node` inserted after `previous_node_id` (`None` = first child)
    ChildNodeInserted {
        parent_node_id: VolatileId,
        previous_node_id: Option<VolatileId>,
        node: NodeDescriptor,
    },
    ChildNodeRemoved {
        parent_node_id: VolatileId,
        node_id: VolatileId,
    },
    ChildNodeCountUpdated {
        node_id: VolatileId,
        child_node_count: u32,
    },
    AttributeModified {
        node_id: VolatileId,
        name: String,
        value: String,
    },
    AttributeRemoved {
        node_id: VolatileId,
        name: String,
    },
    CharacterDataModified {
        node_id: VolatileId,
        character_data: String,
    },
    ShadowRootPushed {
        host_id: VolatileId,
        root: NodeDescriptor,
    },
    ShadowRootPopped {
        host_id: VolatileId,
        root_id: VolatileId,
    },
    DistributedNodesUpdated {
        insertion_point_id: VolatileId,
        distributed_nodes: Vec<BackendNode>,
    },
    InlineStyleInvalidated {
        node_ids: Vec<VolatileId>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetChildNodesParams {
    parent_id: VolatileId,
    nodes: Vec<NodeDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildNodeInsertedParams {
    parent_node_id: VolatileId,
    previous_node_id: u32,
    node: NodeDescriptor,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildNodeRemovedParams {
    parent_node_id: VolatileId,
    node_id: VolatileId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildNodeCountUpdatedParams {
    node_id: VolatileId,
    child_node_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeModifiedParams {
    node_id: VolatileId,
    name: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeRemovedParams {
    node_id: VolatileId,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacterDataModifiedParams {
    node_id: VolatileId,
    character_data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShadowRootPushedParams {
    host_id: VolatileId,
    root: NodeDescriptor,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShadowRootPoppedParams {
    host_id: VolatileId,
    root_id: VolatileId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributedNodesUpdatedParams {
    insertion_point_id: VolatileId,
    distributed_nodes: Vec<BackendNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineStyleInvalidatedParams {
    node_ids: Vec<VolatileId>,
}

fn params<T: DeserializeOwned>(method: &str, params: &Value) -> Result<T> {
    T::deserialize(params).map_err(|source| DomError::InvalidEvent {
        method: method.to_string(),
        source,
    })
}

impl DomEvent {
    /// Parse a CDP event; `Ok(None)` for methods the mirror does not track
    pub fn from_cdp(method: &str, raw: &Value) -> Result<Option<Self>> {
        let event = match method {
            "DOM.documentUpdated" => DomEvent::DocumentUpdated,
            "DOM.setChildNodes" => {
                let p: SetChildNodesParams = params(method, raw)?;
                DomEvent::SetChildNodes {
                    parent_id: p.parent_id,
                    nodes: p.nodes,
                }
            }
            "DOM.childNodeInserted" => {
                let p: ChildNodeInsertedParams = params(method, raw)?;
                DomEvent::ChildNodeInserted {
                    parent_node_id: p.parent_node_id,
                    previous_node_id: (p.previous_node_id != 0).then_some(VolatileId(p.previous_node_id)),
                    node: p.node,
                }
            }
            "DOM.childNodeRemoved" => {
                let p: ChildNodeRemovedParams = params(method, raw)?;
                DomEvent::ChildNodeRemoved {
                    parent_node_id: p.parent_node_id,
                    node_id: p.node_id,
                }
            }
            "DOM.childNodeCountUpdated" => {
                let p: ChildNodeCountUpdatedParams = params(method, raw)?;
                DomEvent::ChildNodeCountUpdated {
                    node_id: p.node_id,
                    child_node_count: p.child_node_count,
                }
            }
            "DOM.attributeModified" => {
                let p: AttributeModifiedParams = params(method, raw)?;
                DomEvent::AttributeModified {
                    node_id: p.node_id,
                    name: p.name,
                    value: p.value,
                }
            }
            "DOM.attributeRemoved" => {
                let p: AttributeRemovedParams = params(method, raw)?;
                DomEvent::AttributeRemoved {
                    node_id: p.node_id,
                    name: p.name,
                }
            }
            "DOM.characterDataModified" => {
                let p: CharacterDataModifiedParams = params(method, raw)?;
                DomEvent::CharacterDataModified {
                    node_id: p.node_id,
                    character_data: p.character_data,
                }
            }
            "DOM.shadowRootPushed" => {
                let p: ShadowRootPushedParams = params(method, raw)?;
                DomEvent::ShadowRootPushed {
                    host_id: p.host_id,
                    root: p.root,
                }
            }
            "DOM.shadowRootPopped" => {
                let p: ShadowRootPoppedParams = params(method, raw)?;
                DomEvent::ShadowRootPopped {
                    host_id: p.host_id,
                    root_id: p.root_id,
                }
            }
            "DOM.distributedNodesUpdated" => {
                let p: DistributedNodesUpdatedParams = params(method, raw)?;
                DomEvent::DistributedNodesUpdated {
                    insertion_point_id: p.insertion_point_id,
                    distributed_nodes: p.distributed_nodes,
                }
            }
            "DOM.inlineStyleInvalidated" => {
                let p: InlineStyleInvalidatedParams = params(method, raw)?;
                DomEvent::InlineStyleInvalidated { node_ids: p.node_ids }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Normalized change notification, serialized as `{"kind", "payload"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum MirrorUpdate {
    /// A fresh document was loaded; everything held before is invalid
    Reset { root: StableId, generation: u64 },
    /// The document was discarded; a reload may follow
    Invalidated { generation: u64 },
    ChildrenReplaced {
        parent: StableId,
        children: Vec<StableId>,
    },
    /// `previous` is `None` when inserted first or when the remote anchor
    /// was never mirrored (the child is then appended)
    ChildInserted {
        parent: StableId,
        child: StableId,
        previous: Option<StableId>,
    },
    ChildRemoved { parent: StableId, child: StableId },
    ChildCountChanged { node: StableId, count: u32 },
    AttributeSet {
        node: StableId,
        name: String,
        value: String,
    },
    AttributeRemoved { node: StableId, name: String },
    TextChanged { node: StableId, value: String },
    ShadowRootAttached { host: StableId, root: StableId },
    ShadowRootDetached { host: StableId, root: StableId },
    DistributedNodesChanged { node: StableId },
    StyleInvalidated { nodes: Vec<StableId> },
}

impl MirrorUpdate {
    /// Wire name of the update kind
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorUpdate::Reset { .. } => "reset",
            MirrorUpdate::Invalidated { .. } => "invalidated",
            MirrorUpdate::ChildrenReplaced { .. } => "children-replaced",
            MirrorUpdate::ChildInserted { .. } => "child-inserted",
            MirrorUpdate::ChildRemoved { .. } => "child-removed",
            MirrorUpdate::ChildCountChanged { .. } => "child-count-changed",
            MirrorUpdate::AttributeSet { .. } => "attribute-set",
            MirrorUpdate::AttributeRemoved { .. } => "attribute-removed",
            MirrorUpdate::TextChanged { .. } => "text-changed",
            MirrorUpdate::ShadowRootAttached { .. } => "shadow-root-attached",
            MirrorUpdate::ShadowRootDetached { .. } => "shadow-root-detached",
            MirrorUpdate::DistributedNodesChanged { .. } => "distributed-nodes-changed",
            MirrorUpdate::StyleInvalidated { .. } => "style-invalidated",
        }
    }
}
