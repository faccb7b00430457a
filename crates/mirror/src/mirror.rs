//! DomMirror - keeps a NodeRegistry in sync with one remote document
//!
//! ## Concurrency
//!
//! ```text
//! events  ──► apply_event ──┐
//!                           ├─► Mutex<MirrorState> ──► broadcast<MirrorUpdate>
//! queries ──► transport ────┘        (generation)
//! ```
//!
//! The state lock is never held across an await. Every async operation
//! records the generation before its first command and re-checks it under
//! the lock when the response arrives; a mismatch means the document was
//! reset in between and the result is discarded as [`DomError::Stale`].

use crate::descriptor::NodeDescriptor;
use crate::error::{DomError, Result};
use crate::events::{DomEvent, MirrorUpdate};
use crate::node::MirrorNode;
use crate::registry::{InsertAt, NodeRegistry};
use crate::serializer::{DomSerializer, SerializedNode, SerializerConfig};
use crate::transport::DomTransport;
use crate::types::{DomRect, Quad, RemoteObjectId, StableId, VolatileId};
use cdp::{CDPEvent, CDPSession};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Tag carried in every log line of this mirror
    pub id: String,
    /// `depth` passed to `DOM.getDocument`; -1 fetches the whole tree
    pub fetch_depth: i32,
    /// Descend into iframes and shadow roots when fetching
    pub pierce: bool,
    /// Send `DOM.enable` before the first fetch
    pub enable_domain: bool,
    /// Refetch the document automatically after `DOM.documentUpdated`
    pub refetch_on_invalidate: bool,
    /// Capacity of the update broadcast channel
    pub update_capacity: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fetch_depth: -1,
            pierce: true,
            enable_domain: true,
            refetch_on_invalidate: true,
            update_capacity: 1024,
        }
    }
}

/// Lifecycle of the mirrored document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorPhase {
    /// Nothing fetched yet
    Empty,
    /// Document discarded or being fetched; the registry is empty
    Loading,
    Ready,
}

/// Who initiated a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Forward to the remote side first, then mirror locally
    Local,
    /// Already happened remotely; only mirror it
    Remote,
}

/// A node named by either identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Volatile(VolatileId),
    Stable(StableId),
}

struct MirrorState {
    registry: NodeRegistry,
    phase: MirrorPhase,
    generation: u64,
}

impl MirrorState {
    fn check(&self, started: u64) -> Result<()> {
        if self.generation == started {
            Ok(())
        } else {
            Err(DomError::Stale {
                started,
                current: self.generation,
            })
        }
    }
}

/// Live mirror of one document
pub struct DomMirror<T: DomTransport> {
    config: MirrorConfig,
    transport: Arc<T>,
    state: Mutex<MirrorState>,
    updates: broadcast::Sender<MirrorUpdate>,
}

impl<T: DomTransport> DomMirror<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, MirrorConfig::default())
    }

    pub fn with_config(transport: Arc<T>, config: MirrorConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            config,
            transport,
            state: Mutex::new(MirrorState {
                registry: NodeRegistry::new(),
                phase: MirrorPhase::Empty,
                generation: 0,
            }),
            updates,
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Receive every update applied after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MirrorUpdate> {
        self.updates.subscribe()
    }

    pub fn phase(&self) -> MirrorPhase {
        self.state.lock().phase
    }

    /// Bumped on every reset; results from older generations are discarded
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Fetch the document and load it into the registry
    ///
    /// Any previous content is discarded before the fetch starts. Returns
    /// [`DomError::Stale`] if the document was invalidated while the fetch
    /// was in flight.
    pub async fn initialize(&self) -> Result<StableId> {
        if self.config.enable_domain {
            self.command("DOM.enable", json!({})).await?;
        }

        let started = self.begin_reload();
        let result = self
            .command(
                "DOM.getDocument",
                json!({"depth": self.config.fetch_depth, "pierce": self.config.pierce}),
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                self.abandon_reload(started);
                return Err(e);
            }
        };

        let Some(root) = result.get("root") else {
            self.abandon_reload(started);
            return Err(DomError::UnexpectedResponse {
                method: "DOM.getDocument".to_string(),
                detail: "missing root".to_string(),
            });
        };
        let root = match NodeDescriptor::deserialize(root) {
            Ok(root) => root,
            Err(e) => {
                self.abandon_reload(started);
                return Err(e.into());
            }
        };

        let (root_id, nodes) = self.finish_reload(started, &root)?;
        info!(mirror = %self.config.id, %root_id, nodes, generation = started, "document loaded");
        self.publish(MirrorUpdate::Reset {
            root: root_id,
            generation: started,
        });
        Ok(root_id)
    }

    /// Discard the document (navigation or equivalent)
    pub fn invalidate(&self) {
        let generation = self.begin_reload();
        info!(mirror = %self.config.id, generation, "document invalidated");
    }

    fn begin_reload(&self) -> u64 {
        let (generation, had_document) = {
            let mut state = self.state.lock();
            let had_document = state.phase == MirrorPhase::Ready || !state.registry.is_empty();
            state.registry.reset();
            state.generation += 1;
            state.phase = MirrorPhase::Loading;
            (state.generation, had_document)
        };
        if had_document {
            self.publish(MirrorUpdate::Invalidated { generation });
        }
        generation
    }

    fn abandon_reload(&self, started: u64) {
        let mut state = self.state.lock();
        if state.generation == started {
            state.phase = MirrorPhase::Empty;
        }
    }

    fn finish_reload(&self, started: u64, root: &NodeDescriptor) -> Result<(StableId, usize)> {
        let mut state = self.state.lock();
        if let Err(e) = state.check(started) {
            warn!(mirror = %self.config.id, started, current = state.generation, "discarding stale document");
            return Err(e);
        }
        match state.registry.load_root(root) {
            Ok(root_id) => {
                state.phase = MirrorPhase::Ready;
                Ok((root_id, state.registry.len()))
            }
            Err(e) => {
                state.phase = MirrorPhase::Empty;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Parse and apply a raw `DOM.*` event; other methods are ignored
    pub fn handle_cdp_event(&self, method: &str, params: &Value) -> Result<()> {
        match DomEvent::from_cdp(method, params)? {
            Some(event) => self.apply_event(event),
            None => Ok(()),
        }
    }

    /// Apply one mutation event
    ///
    /// Events naming nodes the mirror does not know are logged and absorbed.
    /// Only a malformed payload is an error.
    pub fn apply_event(&self, event: DomEvent) -> Result<()> {
        if event == DomEvent::DocumentUpdated {
            self.invalidate();
            return Ok(());
        }

        let update = {
            let mut state = self.state.lock();
            self.apply_locked(&mut state.registry, event)?
        };
        if let Some(update) = update {
            self.publish(update);
        }
        Ok(())
    }

    /// Stable id behind a volatile id; a miss is a consistency gap
    fn resolve(&self, registry: &NodeRegistry, id: VolatileId, event: &str) -> Option<StableId> {
        let stable = registry.stable_for(id);
        if stable.is_none() {
            debug!(mirror = %self.config.id, event, %id, "event for unknown node ignored");
        }
        stable
    }

    fn apply_locked(&self, registry: &mut NodeRegistry, event: DomEvent) -> Result<Option<MirrorUpdate>> {
        let update = match event {
            DomEvent::DocumentUpdated => None,

            DomEvent::SetChildNodes { parent_id, nodes } => {
                let Some(parent) = self.resolve(registry, parent_id, "setChildNodes") else {
                    return Ok(None);
                };
                registry
                    .replace_children(parent, &nodes)?
                    .map(|children| MirrorUpdate::ChildrenReplaced { parent, children })
            }

            DomEvent::ChildNodeInserted {
                parent_node_id,
                previous_node_id,
                node,
            } => {
                let Some(parent) = self.resolve(registry, parent_node_id, "childNodeInserted") else {
                    return Ok(None);
                };
                let at = match previous_node_id {
                    None => InsertAt::First,
                    Some(prev) => registry.stable_for(prev).map_or(InsertAt::Last, InsertAt::After),
                };
                let previous = match at {
                    InsertAt::After(prev) => Some(prev),
                    InsertAt::First | InsertAt::Last => None,
                };
                registry
                    .insert_child(parent, &node, at)?
                    .map(|child| MirrorUpdate::ChildInserted {
                        parent,
                        child,
                        previous,
                    })
            }

            DomEvent::ChildNodeRemoved {
                parent_node_id,
                node_id,
            } => {
                let Some(child) = self.resolve(registry, node_id, "childNodeRemoved") else {
                    return Ok(None);
                };
                let parent = registry
                    .by_stable_id(child)
                    .and_then(|n| n.parent)
                    .or_else(|| registry.stable_for(parent_node_id));
                registry.remove_node(child);
                parent.map(|parent| MirrorUpdate::ChildRemoved { parent, child })
            }

            DomEvent::ChildNodeCountUpdated {
                node_id,
                child_node_count,
            } => {
                let Some(node) = self.resolve(registry, node_id, "childNodeCountUpdated") else {
                    return Ok(None);
                };
                registry.set_child_node_count(node, child_node_count);
                Some(MirrorUpdate::ChildCountChanged {
                    node,
                    count: child_node_count,
                })
            }

            DomEvent::AttributeModified { node_id, name, value } => {
                let Some(node) = self.resolve(registry, node_id, "attributeModified") else {
                    return Ok(None);
                };
                let unchanged = registry
                    .by_stable_id(node)
                    .and_then(|n| n.attr(&name))
                    .is_some_and(|current| current == value);
                (!unchanged && registry.set_attribute(node, &name, &value))
                    .then_some(MirrorUpdate::AttributeSet { node, name, value })
            }

            DomEvent::AttributeRemoved { node_id, name } => {
                let Some(node) = self.resolve(registry, node_id, "attributeRemoved") else {
                    return Ok(None);
                };
                registry
                    .remove_attribute(node, &name)
                    .then_some(MirrorUpdate::AttributeRemoved { node, name })
            }

            DomEvent::CharacterDataModified {
                node_id,
                character_data,
            } => {
                let Some(node) = self.resolve(registry, node_id, "characterDataModified") else {
                    return Ok(None);
                };
                let unchanged = registry
                    .by_stable_id(node)
                    .and_then(|n| n.text_value())
                    .is_some_and(|current| current == character_data);
                (!unchanged && registry.set_text(node, &character_data)).then_some(
                    MirrorUpdate::TextChanged {
                        node,
                        value: character_data,
                    },
                )
            }

            DomEvent::ShadowRootPushed { host_id, root } => {
                let Some(host) = self.resolve(registry, host_id, "shadowRootPushed") else {
                    return Ok(None);
                };
                registry
                    .attach_shadow_root(host, &root)?
                    .map(|root| MirrorUpdate::ShadowRootAttached { host, root })
            }

            DomEvent::ShadowRootPopped { host_id, root_id } => {
                let Some(root) = self.resolve(registry, root_id, "shadowRootPopped") else {
                    return Ok(None);
                };
                let host = registry
                    .by_stable_id(root)
                    .and_then(|n| n.parent)
                    .or_else(|| registry.stable_for(host_id));
                registry.remove_node(root);
                host.map(|host| MirrorUpdate::ShadowRootDetached { host, root })
            }

            DomEvent::DistributedNodesUpdated {
                insertion_point_id,
                distributed_nodes,
            } => {
                let Some(node) = self.resolve(registry, insertion_point_id, "distributedNodesUpdated") else {
                    return Ok(None);
                };
                let ids: Vec<StableId> = distributed_nodes.iter().map(|n| n.backend_node_id).collect();
                registry
                    .set_distributed_nodes(node, &ids)
                    .then_some(MirrorUpdate::DistributedNodesChanged { node })
            }

            DomEvent::InlineStyleInvalidated { node_ids } => {
                let nodes: Vec<StableId> = node_ids
                    .into_iter()
                    .filter_map(|id| self.resolve(registry, id, "inlineStyleInvalidated"))
                    .collect();
                (!nodes.is_empty()).then_some(MirrorUpdate::StyleInvalidated { nodes })
            }
        };
        Ok(update)
    }

    /// Apply events until the stream closes
    ///
    /// A `DOM.documentUpdated` refetches the document in line when
    /// `refetch_on_invalidate` is set; later events wait for it.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<CDPEvent>) {
        while let Some(event) = events.recv().await {
            let params = event.params.unwrap_or(Value::Null);
            let parsed = match DomEvent::from_cdp(&event.method, &params) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(mirror = %self.config.id, method = %event.method, "dropping event: {}", e);
                    continue;
                }
            };

            let reload = parsed == DomEvent::DocumentUpdated;
            if let Err(e) = self.apply_event(parsed) {
                warn!(mirror = %self.config.id, method = %event.method, "failed to apply event: {}", e);
            }

            // Events behind the invalidation stay queued until the new
            // document is loaded, then apply against it
            if reload && self.config.refetch_on_invalidate {
                match self.initialize().await {
                    Ok(_) => {}
                    Err(e @ DomError::Stale { .. }) => debug!(mirror = %self.config.id, "{}", e),
                    Err(e) => error!(mirror = %self.config.id, "document refetch failed: {}", e),
                }
            }
        }
        info!(mirror = %self.config.id, "event stream closed");
    }

    // ========================================================================
    // Remote queries
    // ========================================================================

    /// First match of `selector` under `context` (document root if `None`)
    pub async fn query_selector(&self, selector: &str, context: Option<StableId>) -> Result<Option<StableId>> {
        let (started, context) = self.context_handle(context).await?;
        let result = self
            .command(
                "DOM.querySelector",
                json!({"nodeId": context.0, "selector": selector}),
            )
            .await?;
        match result.get("nodeId").and_then(Value::as_u64).unwrap_or(0) {
            0 => Ok(None),
            id => self.resolve_volatile(VolatileId(id as u32), started).await.map(Some),
        }
    }

    /// All matches of `selector` under `context`, in document order
    ///
    /// Nodes already mirrored come back as their existing instances; others
    /// are described and registered on the way.
    pub async fn query_selector_all(&self, selector: &str, context: Option<StableId>) -> Result<Vec<StableId>> {
        let (started, context) = self.context_handle(context).await?;
        let result = self
            .command(
                "DOM.querySelectorAll",
                json!({"nodeId": context.0, "selector": selector}),
            )
            .await?;
        let ids: Vec<VolatileId> = match result.get("nodeIds") {
            Some(ids) => Vec::<VolatileId>::deserialize(ids)?,
            None => Vec::new(),
        };

        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            found.push(self.resolve_volatile(id, started).await?);
        }
        Ok(found)
    }

    /// Fetch a node's descriptor and register it
    ///
    /// Returns the existing instance if the node is already known.
    pub async fn describe_node(&self, target: NodeRef) -> Result<StableId> {
        let started = self.generation();
        self.describe(target, started).await
    }

    async fn describe(&self, target: NodeRef, started: u64) -> Result<StableId> {
        let params = match target {
            NodeRef::Volatile(id) => json!({"nodeId": id.0}),
            NodeRef::Stable(id) => json!({"backendNodeId": id.0}),
        };
        let result = self.command("DOM.describeNode", params).await?;
        let Some(node) = result.get("node") else {
            return Err(DomError::UnexpectedResponse {
                method: "DOM.describeNode".to_string(),
                detail: "missing node".to_string(),
            });
        };
        let mut desc = NodeDescriptor::deserialize(node)?;
        if let NodeRef::Volatile(id) = target {
            if desc.volatile_id().is_none() {
                desc.node_id = Some(id.0);
            }
        }

        let mut state = self.state.lock();
        state.check(started)?;
        Ok(state.registry.register_node(&desc)?.stable_id)
    }

    async fn resolve_volatile(&self, id: VolatileId, started: u64) -> Result<StableId> {
        {
            let state = self.state.lock();
            state.check(started)?;
            if let Some(stable) = state.registry.stable_for(id) {
                return Ok(stable);
            }
        }
        self.describe(NodeRef::Volatile(id), started).await
    }

    async fn context_handle(&self, context: Option<StableId>) -> Result<(u64, VolatileId)> {
        let (started, context) = {
            let state = self.state.lock();
            if state.phase != MirrorPhase::Ready {
                return Err(DomError::NotReady);
            }
            let context = context.or(state.registry.root_id()).ok_or(DomError::NotReady)?;
            (state.generation, context)
        };
        let handle = self.volatile_handle(context, started).await?;
        Ok((started, handle))
    }

    /// Volatile id for `id`, pushing the node to the frontend if it has none
    async fn volatile_handle(&self, id: StableId, started: u64) -> Result<VolatileId> {
        {
            let state = self.state.lock();
            state.check(started)?;
            let node = state.registry.by_stable_id(id).ok_or(DomError::NodeNotFound(id))?;
            if let Some(volatile) = node.volatile_id {
                return Ok(volatile);
            }
        }

        let method = "DOM.pushNodesByBackendIdsToFrontend";
        let result = self.command(method, json!({"backendNodeIds": [id.0]})).await?;
        let volatile = result
            .get("nodeIds")
            .and_then(|ids| ids.get(0))
            .and_then(Value::as_u64)
            .filter(|&v| v != 0)
            .ok_or_else(|| DomError::UnexpectedResponse {
                method: method.to_string(),
                detail: format!("no node id for {}", id),
            })?;
        let volatile = VolatileId(volatile as u32);

        let mut state = self.state.lock();
        state.check(started)?;
        state.registry.set_volatile_id(id, volatile);
        Ok(volatile)
    }

    /// Ask the remote side to deliver `id`'s children as `setChildNodes`
    pub async fn request_child_nodes(&self, id: StableId, depth: i32) -> Result<()> {
        let started = self.generation();
        let handle = self.volatile_handle(id, started).await?;
        self.command(
            "DOM.requestChildNodes",
            json!({"nodeId": handle.0, "depth": depth, "pierce": self.config.pierce}),
        )
        .await?;
        Ok(())
    }

    /// Content quads of a node, in CSS pixels
    pub async fn content_quads(&self, id: StableId) -> Result<Vec<Quad>> {
        if !self.contains(id) {
            return Err(DomError::NodeNotFound(id));
        }
        let result = self
            .command("DOM.getContentQuads", json!({"backendNodeId": id.0}))
            .await?;
        let raw: Vec<Vec<f64>> = match result.get("quads") {
            Some(quads) => Vec::<Vec<f64>>::deserialize(quads)?,
            None => Vec::new(),
        };
        Ok(raw
            .into_iter()
            .filter_map(|q| <Quad>::try_from(q.as_slice()).ok())
            .collect())
    }

    /// Bounding box of the node's content quads, cached on the element
    ///
    /// `None` when the node is not rendered.
    pub async fn geometry(&self, id: StableId) -> Result<Option<DomRect>> {
        let started = self.generation();
        let quads = self.content_quads(id).await?;
        let rect = DomRect::bounding(&quads);

        let mut state = self.state.lock();
        state.check(started)?;
        if let Some(el) = state.registry.get_mut(id).and_then(|n| n.element_mut()) {
            el.geometry = rect;
        }
        Ok(rect)
    }

    /// Geometry from the last `geometry` call, if any
    pub fn cached_geometry(&self, id: StableId) -> Option<DomRect> {
        self.read(|registry| registry.by_stable_id(id)?.element()?.geometry)
    }

    /// Runtime object handle for a node (`DOM.resolveNode`)
    pub async fn resolve_remote_object(&self, id: StableId) -> Result<RemoteObjectId> {
        if !self.contains(id) {
            return Err(DomError::NodeNotFound(id));
        }
        let method = "DOM.resolveNode";
        let result = self.command(method, json!({"backendNodeId": id.0})).await?;
        result
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DomError::UnexpectedResponse {
                method: method.to_string(),
                detail: "missing objectId".to_string(),
            })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn set_attribute(&self, id: StableId, name: &str, value: &str, origin: WriteOrigin) -> Result<()> {
        self.forward(
            id,
            origin,
            "DOM.setAttributeValue",
            json!({"name": name, "value": value}),
        )
        .await?;

        let applied = self.state.lock().registry.set_attribute(id, name, value);
        if applied {
            self.publish(MirrorUpdate::AttributeSet {
                node: id,
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    pub async fn remove_attribute(&self, id: StableId, name: &str, origin: WriteOrigin) -> Result<()> {
        self.forward(id, origin, "DOM.removeAttribute", json!({"name": name}))
            .await?;

        let removed = self.state.lock().registry.remove_attribute(id, name);
        if removed {
            self.publish(MirrorUpdate::AttributeRemoved {
                node: id,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn set_text_value(&self, id: StableId, value: &str, origin: WriteOrigin) -> Result<()> {
        self.forward(id, origin, "DOM.setNodeValue", json!({"value": value}))
            .await?;

        let applied = self.state.lock().registry.set_text(id, value);
        if applied {
            self.publish(MirrorUpdate::TextChanged {
                node: id,
                value: value.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a node and its subtree
    pub async fn remove_node(&self, id: StableId, origin: WriteOrigin) -> Result<()> {
        self.forward(id, origin, "DOM.removeNode", json!({})).await?;

        let parent = {
            let mut state = self.state.lock();
            let parent = state.registry.by_stable_id(id).and_then(|n| n.parent);
            state.registry.remove_node(id).then_some(parent).flatten()
        };
        if let Some(parent) = parent {
            self.publish(MirrorUpdate::ChildRemoved { parent, child: id });
        }
        Ok(())
    }

    /// Send a write command for a locally-initiated change
    ///
    /// The `nodeId` is filled in from the node's volatile id. Remote-origin
    /// writes are not forwarded.
    async fn forward(&self, id: StableId, origin: WriteOrigin, method: &str, mut params: Value) -> Result<()> {
        if origin == WriteOrigin::Remote {
            return Ok(());
        }
        let started = self.generation();
        let handle = self.volatile_handle(id, started).await?;
        if let Some(params) = params.as_object_mut() {
            params.insert("nodeId".to_string(), json!(handle.0));
        }
        self.command(method, params).await?;
        self.state.lock().check(started)
    }

    // ========================================================================
    // Local reads
    // ========================================================================

    /// Run `f` against the registry under the state lock
    ///
    /// Do not block inside `f`; event application waits on the same lock.
    pub fn read<R>(&self, f: impl FnOnce(&NodeRegistry) -> R) -> R {
        f(&self.state.lock().registry)
    }

    /// Snapshot of a node
    pub fn get_by_stable_id(&self, id: StableId) -> Option<MirrorNode> {
        self.read(|registry| registry.by_stable_id(id).cloned())
    }

    /// Snapshot of a node by its current volatile id
    pub fn get_by_volatile_id(&self, id: VolatileId) -> Option<MirrorNode> {
        self.read(|registry| registry.by_volatile_id(id).cloned())
    }

    pub fn contains(&self, id: StableId) -> bool {
        self.read(|registry| registry.contains(id))
    }

    pub fn root_id(&self) -> Option<StableId> {
        self.read(|registry| registry.root_id())
    }

    pub fn len(&self) -> usize {
        self.read(|registry| registry.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read(|registry| registry.is_empty())
    }

    pub fn selector_hint(&self, id: StableId) -> Option<String> {
        self.state.lock().registry.selector_hint(id)
    }

    /// Owned snapshot of the whole document
    pub fn to_serializable(&self) -> Option<SerializedNode> {
        self.to_serializable_with(SerializerConfig::default())
    }

    pub fn to_serializable_with(&self, config: SerializerConfig) -> Option<SerializedNode> {
        let serializer = DomSerializer::with_config(config);
        self.read(|registry| serializer.serialize_root(registry))
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        self.transport
            .command(method, params)
            .await
            .map_err(|source| DomError::Transport {
                method: method.to_string(),
                source,
            })
    }

    fn publish(&self, update: MirrorUpdate) {
        // no receivers is fine
        let _ = self.updates.send(update);
    }
}

impl DomMirror<CDPSession> {
    /// Mirror the document of an attached session
    ///
    /// Subscribes to `DOM` events before fetching so nothing between the
    /// fetch and the first event is lost, then drives them on a task.
    pub async fn attach(session: CDPSession, config: MirrorConfig) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let events = session.events("DOM");
        let mirror = Arc::new(Self::with_config(Arc::new(session), config));
        mirror.initialize().await?;
        let driver = tokio::spawn(mirror.clone().run(events));
        Ok((mirror, driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use tokio_test::{assert_err, assert_ok};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config() -> MirrorConfig {
        init_tracing();
        MirrorConfig {
            id: "test".to_string(),
            refetch_on_invalidate: false,
            ..MirrorConfig::default()
        }
    }

    fn two_divs() -> Value {
        json!({"root": {
            "nodeId": 1, "backendNodeId": 1, "nodeType": 9, "nodeName": "#document",
            "children": [
                {"nodeId": 2, "backendNodeId": 2, "nodeType": 1, "nodeName": "DIV", "attributes": ["id", "a"]},
                {"nodeId": 3, "backendNodeId": 3, "nodeType": 1, "nodeName": "DIV", "attributes": ["id", "b"]}
            ]
        }})
    }

    async fn loaded() -> (Arc<ScriptedTransport>, Arc<DomMirror<ScriptedTransport>>) {
        let transport = ScriptedTransport::new();
        transport.respond("DOM.getDocument", two_divs());
        let mirror = Arc::new(DomMirror::with_config(transport.clone(), config()));
        assert_ok!(mirror.initialize().await);
        (transport, mirror)
    }

    #[tokio::test]
    async fn test_initialize_loads_document() {
        let transport = ScriptedTransport::new();
        transport.respond("DOM.getDocument", two_divs());
        let mirror = DomMirror::with_config(transport.clone(), config());
        let mut updates = mirror.subscribe();
        assert_eq!(mirror.phase(), MirrorPhase::Empty);

        let root = mirror.initialize().await.unwrap();

        assert_eq!(root, StableId(1));
        assert_eq!(mirror.phase(), MirrorPhase::Ready);
        assert_eq!(mirror.len(), 3);
        assert_eq!(
            serde_json::to_value(mirror.to_serializable()).unwrap(),
            json!({"tag": "#document", "children": [
                {"tag": "div", "attributes": {"id": "a"}},
                {"tag": "div", "attributes": {"id": "b"}}
            ]})
        );
        assert_eq!(
            updates.try_recv().unwrap(),
            MirrorUpdate::Reset {
                root: StableId(1),
                generation: 1
            }
        );

        let calls = transport.calls();
        assert_eq!(calls[0].0, "DOM.enable");
        assert_eq!(calls[1], ("DOM.getDocument".to_string(), json!({"depth": -1, "pierce": true})));
    }

    #[tokio::test]
    async fn test_attribute_event_updates_in_place() {
        let (_, mirror) = loaded().await;
        let mut updates = mirror.subscribe();

        mirror
            .handle_cdp_event(
                "DOM.attributeModified",
                &json!({"nodeId": 2, "name": "class", "value": "active"}),
            )
            .unwrap();

        let node = mirror.get_by_stable_id(StableId(2)).unwrap();
        assert_eq!(node.attr("class"), Some("active"));
        assert_eq!(node.attr("id"), Some("a"));
        assert_eq!(mirror.len(), 3);
        assert_eq!(updates.try_recv().unwrap().kind(), "attribute-set");

        // an identical echo is not re-announced
        mirror
            .handle_cdp_event(
                "DOM.attributeModified",
                &json!({"nodeId": 2, "name": "class", "value": "active"}),
            )
            .unwrap();
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_child_removed_event() {
        let (_, mirror) = loaded().await;

        mirror
            .handle_cdp_event("DOM.childNodeRemoved", &json!({"parentNodeId": 1, "nodeId": 3}))
            .unwrap();

        assert!(mirror.get_by_stable_id(StableId(3)).is_none());
        assert!(mirror.get_by_volatile_id(VolatileId(3)).is_none());
        let root = mirror.get_by_stable_id(StableId(1)).unwrap();
        assert_eq!(root.children.as_slice(), &[StableId(2)]);
    }

    #[tokio::test]
    async fn test_query_returns_existing_instances() {
        let (transport, mirror) = loaded().await;
        transport.respond("DOM.querySelectorAll", json!({"nodeIds": [2, 3]}));

        let found = mirror.query_selector_all("div", None).await.unwrap();

        assert_eq!(found, vec![StableId(2), StableId(3)]);
        assert_eq!(mirror.len(), 3);
        assert_eq!(transport.calls_to("DOM.describeNode"), 0);
        assert_eq!(
            transport.calls().last().unwrap().1,
            json!({"nodeId": 1, "selector": "div"})
        );
        mirror.read(|registry| {
            let a = registry.by_stable_id(StableId(2)).unwrap();
            let b = registry.by_volatile_id(VolatileId(2)).unwrap();
            assert!(std::ptr::eq(a, b));
        });
    }

    #[tokio::test]
    async fn test_query_describes_unknown_node_once() {
        let (transport, mirror) = loaded().await;
        transport.respond("DOM.querySelector", json!({"nodeId": 40}));
        transport.respond("DOM.querySelector", json!({"nodeId": 40}));
        transport.respond(
            "DOM.describeNode",
            json!({"node": {"backendNodeId": 400, "nodeType": 1, "nodeName": "SPAN", "parentId": 2}}),
        );

        let first = mirror.query_selector("span", None).await.unwrap();
        let second = mirror.query_selector("span", None).await.unwrap();

        assert_eq!(first, Some(StableId(400)));
        assert_eq!(second, first);
        assert_eq!(transport.calls_to("DOM.describeNode"), 1);
        let node = mirror.get_by_volatile_id(VolatileId(40)).unwrap();
        assert_eq!(node.stable_id, StableId(400));
        assert_eq!(node.parent, Some(StableId(2)));
    }

    #[tokio::test]
    async fn test_removing_parent_drops_described_child() {
        let (transport, mirror) = loaded().await;
        transport.respond("DOM.querySelector", json!({"nodeId": 40}));
        transport.respond(
            "DOM.describeNode",
            json!({"node": {"backendNodeId": 400, "nodeType": 1, "nodeName": "SPAN", "parentId": 2}}),
        );
        assert_eq!(mirror.query_selector("span", None).await.unwrap(), Some(StableId(400)));

        mirror
            .handle_cdp_event("DOM.childNodeRemoved", &json!({"parentNodeId": 1, "nodeId": 2}))
            .unwrap();

        assert!(mirror.get_by_stable_id(StableId(400)).is_none());
        assert!(mirror.get_by_volatile_id(VolatileId(40)).is_none());
        assert_eq!(mirror.len(), 2);
        mirror.read(|registry| registry.assert_consistent());
    }

    #[tokio::test]
    async fn test_query_without_match() {
        let (transport, mirror) = loaded().await;
        transport.respond("DOM.querySelector", json!({"nodeId": 0}));
        assert_eq!(mirror.query_selector("nav", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_before_initialize() {
        let transport = ScriptedTransport::new();
        let mirror = DomMirror::with_config(transport.clone(), config());
        let err = mirror.query_selector("div", None).await.unwrap_err();
        assert!(matches!(err, DomError::NotReady));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_describe_after_invalidation() {
        let (transport, mirror) = loaded().await;
        let gate = transport.gate("DOM.describeNode");
        transport.respond(
            "DOM.describeNode",
            json!({"node": {"nodeId": 40, "backendNodeId": 40, "nodeType": 1, "nodeName": "P"}}),
        );

        let pending = {
            let mirror = mirror.clone();
            tokio::spawn(async move { mirror.describe_node(NodeRef::Stable(StableId(40))).await })
        };
        while transport.calls_to("DOM.describeNode") == 0 {
            tokio::task::yield_now().await;
        }

        mirror.handle_cdp_event("DOM.documentUpdated", &json!({})).unwrap();
        assert!(mirror.is_empty());
        assert_eq!(mirror.phase(), MirrorPhase::Loading);

        gate.notify_one();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DomError::Stale { started: 1, current: 2 })));
        assert!(mirror.is_empty());
        assert!(!mirror.contains(StableId(40)));
    }

    #[tokio::test]
    async fn test_stale_document_fetch() {
        let transport = ScriptedTransport::new();
        let mirror = Arc::new(DomMirror::with_config(transport.clone(), config()));
        let gate = transport.gate("DOM.getDocument");
        transport.respond("DOM.getDocument", two_divs());

        let pending = {
            let mirror = mirror.clone();
            tokio::spawn(async move { mirror.initialize().await })
        };
        while transport.calls_to("DOM.getDocument") == 0 {
            tokio::task::yield_now().await;
        }
        mirror.invalidate();
        gate.notify_one();

        assert_err!(pending.await.unwrap());
        assert!(mirror.is_empty());
        assert_eq!(mirror.root_id(), None);
    }

    #[tokio::test]
    async fn test_events_for_unknown_nodes_are_absorbed() {
        let (_, mirror) = loaded().await;
        let mut updates = mirror.subscribe();

        assert_ok!(mirror.handle_cdp_event(
            "DOM.attributeModified",
            &json!({"nodeId": 99, "name": "x", "value": "y"})
        ));
        assert_ok!(mirror.handle_cdp_event(
            "DOM.childNodeInserted",
            &json!({"parentNodeId": 99, "previousNodeId": 0,
                    "node": {"nodeId": 50, "backendNodeId": 50, "nodeType": 1, "nodeName": "B"}})
        ));
        assert_ok!(mirror.handle_cdp_event("DOM.childNodeRemoved", &json!({"parentNodeId": 1, "nodeId": 99})));

        assert_eq!(mirror.len(), 3);
        assert!(!mirror.contains(StableId(50)));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_event_is_an_error() {
        let (_, mirror) = loaded().await;
        let err = mirror
            .handle_cdp_event(
                "DOM.setChildNodes",
                &json!({"parentId": 2, "nodes": [{"nodeId": 9, "nodeType": 1, "nodeName": "B"}]}),
            )
            .unwrap_err();
        assert!(matches!(err, DomError::MalformedDescriptor(_)));
        assert!(mirror.get_by_stable_id(StableId(2)).unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn test_insert_and_set_child_nodes() {
        let (_, mirror) = loaded().await;
        let inserted = json!({"parentNodeId": 1, "previousNodeId": 2,
            "node": {"nodeId": 4, "backendNodeId": 4, "nodeType": 1, "nodeName": "SPAN"}});

        mirror.handle_cdp_event("DOM.childNodeInserted", &inserted).unwrap();
        mirror.handle_cdp_event("DOM.childNodeInserted", &inserted).unwrap();

        let children = mirror.get_by_stable_id(StableId(1)).unwrap().children;
        assert_eq!(children.as_slice(), &[StableId(2), StableId(4), StableId(3)]);

        mirror
            .handle_cdp_event(
                "DOM.setChildNodes",
                &json!({"parentId": 4, "nodes": [
                    {"nodeId": 5, "backendNodeId": 5, "nodeType": 3, "nodeName": "#text", "nodeValue": "hi"}
                ]}),
            )
            .unwrap();
        mirror
            .handle_cdp_event("DOM.characterDataModified", &json!({"nodeId": 5, "characterData": "bye"}))
            .unwrap();

        let text = mirror.get_by_stable_id(StableId(5)).unwrap();
        assert_eq!(text.parent, Some(StableId(4)));
        assert_eq!(text.text_value(), Some("bye"));
        mirror.read(|registry| registry.assert_consistent());
    }

    #[tokio::test]
    async fn test_insert_after_unmirrored_sibling_appends() {
        let (_, mirror) = loaded().await;
        let mut updates = mirror.subscribe();

        mirror
            .handle_cdp_event(
                "DOM.childNodeInserted",
                &json!({"parentNodeId": 1, "previousNodeId": 99,
                    "node": {"nodeId": 4, "backendNodeId": 4, "nodeType": 1, "nodeName": "SPAN"}}),
            )
            .unwrap();

        let children = mirror.get_by_stable_id(StableId(1)).unwrap().children;
        assert_eq!(children.as_slice(), &[StableId(2), StableId(3), StableId(4)]);
        assert_eq!(
            updates.try_recv().unwrap(),
            MirrorUpdate::ChildInserted {
                parent: StableId(1),
                child: StableId(4),
                previous: None
            }
        );
    }

    #[tokio::test]
    async fn test_shadow_root_events() {
        let (_, mirror) = loaded().await;
        let mut updates = mirror.subscribe();

        mirror
            .handle_cdp_event(
                "DOM.shadowRootPushed",
                &json!({"hostId": 2, "root": {"nodeId": 20, "backendNodeId": 20, "nodeType": 11,
                    "nodeName": "#document-fragment", "shadowRootType": "open"}}),
            )
            .unwrap();
        assert_eq!(
            mirror.get_by_stable_id(StableId(2)).unwrap().shadow_roots.as_slice(),
            &[StableId(20)]
        );

        mirror
            .handle_cdp_event("DOM.shadowRootPopped", &json!({"hostId": 2, "rootId": 20}))
            .unwrap();
        assert!(!mirror.contains(StableId(20)));
        assert!(mirror.get_by_stable_id(StableId(2)).unwrap().shadow_roots.is_empty());

        assert_eq!(updates.try_recv().unwrap().kind(), "shadow-root-attached");
        assert_eq!(
            updates.try_recv().unwrap(),
            MirrorUpdate::ShadowRootDetached {
                host: StableId(2),
                root: StableId(20)
            }
        );
    }

    #[tokio::test]
    async fn test_local_write_is_forwarded() {
        let (transport, mirror) = loaded().await;

        mirror
            .set_attribute(StableId(3), "title", "x", WriteOrigin::Local)
            .await
            .unwrap();
        assert_eq!(
            transport.calls().last().unwrap(),
            &(
                "DOM.setAttributeValue".to_string(),
                json!({"nodeId": 3, "name": "title", "value": "x"})
            )
        );
        assert_eq!(mirror.get_by_stable_id(StableId(3)).unwrap().attr("title"), Some("x"));

        let before = transport.calls().len();
        mirror
            .remove_attribute(StableId(3), "title", WriteOrigin::Remote)
            .await
            .unwrap();
        assert_eq!(transport.calls().len(), before);
        assert_eq!(mirror.get_by_stable_id(StableId(3)).unwrap().attr("title"), None);

        mirror.remove_node(StableId(3), WriteOrigin::Local).await.unwrap();
        assert_eq!(transport.calls().last().unwrap().0, "DOM.removeNode");
        assert!(!mirror.contains(StableId(3)));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let (transport, mirror) = loaded().await;
        transport.fail("DOM.removeNode", "Could not find node");

        let err = mirror.remove_node(StableId(2), WriteOrigin::Local).await.unwrap_err();

        assert!(matches!(err, DomError::Transport { ref method, .. } if method == "DOM.removeNode"));
        assert!(mirror.contains(StableId(2)));
    }

    #[tokio::test]
    async fn test_write_to_stable_only_node_pushes_it_first() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "DOM.getDocument",
            json!({"root": {"backendNodeId": 1, "nodeType": 9,
                "children": [{"backendNodeId": 7, "nodeType": 3, "nodeValue": "a"}]}}),
        );
        transport.respond("DOM.pushNodesByBackendIdsToFrontend", json!({"nodeIds": [70]}));
        let mirror = DomMirror::with_config(transport.clone(), config());
        mirror.initialize().await.unwrap();

        mirror
            .set_text_value(StableId(7), "b", WriteOrigin::Local)
            .await
            .unwrap();

        assert_eq!(
            transport.calls().last().unwrap().1,
            json!({"nodeId": 70, "value": "b"})
        );
        let node = mirror.get_by_volatile_id(VolatileId(70)).unwrap();
        assert_eq!(node.stable_id, StableId(7));
        assert_eq!(node.text_value(), Some("b"));
    }

    #[tokio::test]
    async fn test_geometry_is_cached() {
        let (transport, mirror) = loaded().await;
        transport.respond(
            "DOM.getContentQuads",
            json!({"quads": [[10.0, 10.0, 30.0, 10.0, 30.0, 20.0, 10.0, 20.0]]}),
        );

        let rect = mirror.geometry(StableId(2)).await.unwrap().unwrap();

        assert_eq!(rect, DomRect::new(10.0, 10.0, 20.0, 10.0));
        assert_eq!(mirror.cached_geometry(StableId(2)), Some(rect));
        assert_eq!(mirror.cached_geometry(StableId(3)), None);
    }

    #[tokio::test]
    async fn test_resolve_remote_object() {
        let (transport, mirror) = loaded().await;
        transport.respond("DOM.resolveNode", json!({"object": {"type": "object", "objectId": "obj-1"}}));

        let object = mirror.resolve_remote_object(StableId(2)).await.unwrap();
        assert_eq!(object, "obj-1");

        let err = mirror.resolve_remote_object(StableId(2)).await.unwrap_err();
        assert!(matches!(err, DomError::UnexpectedResponse { .. }));
        assert!(matches!(
            mirror.resolve_remote_object(StableId(99)).await,
            Err(DomError::NodeNotFound(StableId(99)))
        ));
    }

    #[tokio::test]
    async fn test_run_refetches_after_document_updated() {
        let transport = ScriptedTransport::new();
        transport.respond("DOM.getDocument", two_divs());
        transport.respond(
            "DOM.getDocument",
            json!({"root": {"nodeId": 10, "backendNodeId": 10, "nodeType": 9}}),
        );
        let mirror = Arc::new(DomMirror::with_config(
            transport.clone(),
            MirrorConfig {
                refetch_on_invalidate: true,
                ..config()
            },
        ));
        mirror.initialize().await.unwrap();
        let mut updates = mirror.subscribe();

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(mirror.clone().run(rx));
        tx.send(CDPEvent {
            method: "DOM.documentUpdated".to_string(),
            params: Some(json!({})),
            session_id: None,
        })
        .unwrap();

        assert_eq!(updates.recv().await.unwrap(), MirrorUpdate::Invalidated { generation: 2 });
        // the refetch starts its own generation
        assert_eq!(
            updates.recv().await.unwrap(),
            MirrorUpdate::Reset {
                root: StableId(10),
                generation: 3
            }
        );
        assert_eq!(mirror.len(), 1);
        assert_eq!(transport.calls_to("DOM.getDocument"), 2);

        drop(tx);
        driver.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_after_refetch_are_not_lost() {
        let transport = ScriptedTransport::new();
        transport.respond("DOM.getDocument", two_divs());
        transport.respond("DOM.getDocument", two_divs());
        let mirror = Arc::new(DomMirror::with_config(
            transport.clone(),
            MirrorConfig {
                refetch_on_invalidate: true,
                ..config()
            },
        ));
        mirror.initialize().await.unwrap();
        let mut updates = mirror.subscribe();
        let gate = transport.gate("DOM.getDocument");

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(mirror.clone().run(rx));
        for (method, params) in [
            ("DOM.documentUpdated", json!({})),
            ("DOM.attributeModified", json!({"nodeId": 2, "name": "class", "value": "x"})),
        ] {
            tx.send(CDPEvent {
                method: method.to_string(),
                params: Some(params),
                session_id: None,
            })
            .unwrap();
        }
        gate.notify_one();

        let wait = async {
            loop {
                if let MirrorUpdate::AttributeSet { .. } = updates.recv().await.unwrap() {
                    break;
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), wait)
            .await
            .expect("attribute change was dropped");

        assert_eq!(mirror.get_by_stable_id(StableId(2)).unwrap().attr("class"), Some("x"));
        assert_eq!(transport.calls_to("DOM.getDocument"), 2);

        drop(tx);
        driver.await.unwrap();
    }

    #[test]
    fn test_config_defaults() {
        let a = MirrorConfig::default();
        let b = MirrorConfig::default();
        assert_ne!(a.id, b.id);
        assert_eq!(a.fetch_depth, -1);
        assert!(a.pierce && a.enable_domain && a.refetch_on_invalidate);
    }
}
