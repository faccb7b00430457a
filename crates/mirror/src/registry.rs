//! Node registry: the arena that owns every mirrored node
//!
//! ## Memory Layout
//!
//! ```text
//! slots:      [Some(Node)][None][Some(Node)]...   arena, updated in place
//! by_stable:  StableId   -> slot index
//! by_volatile: VolatileId -> StableId
//! ```
//!
//! Nodes never move between slots while they live, so "the same node" is
//! "the same slot". Freed slots are reused after removal or reset.
//!
//! Invariants:
//! - every `StableId` reachable through `by_volatile` is in `by_stable`
//! - after any public call returns, every id listed in a node's `children`,
//!   `shadow_roots` or frame `content_document` is registered
//!
//! Missing ids are never errors here: removal of an absent node, or a
//! mutation naming one, is a no-op the caller may log.

use crate::descriptor::NodeDescriptor;
use crate::error::Result;
use crate::node::{MirrorNode, NodeKind};
use crate::selector;
use crate::types::{StableId, VolatileId};
use ahash::AHashMap;

/// Where [`NodeRegistry::insert_child`] places the new child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    First,
    After(StableId),
    Last,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    slots: Vec<Option<MirrorNode>>,
    free: Vec<usize>,
    by_stable: AHashMap<StableId, usize>,
    by_volatile: AHashMap<VolatileId, StableId>,
    /// How many live nodes carry each CSS class
    classes: AHashMap<String, usize>,
    /// Nodes that name a parent (`parentId`) without being listed under it
    adopted: AHashMap<StableId, Vec<StableId>>,
    root: Option<StableId>,
}

fn class_list(node: &MirrorNode) -> Vec<String> {
    node.attr("class")
        .map(|c| c.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1024) // Pre-allocate for typical page
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            by_stable: AHashMap::with_capacity(capacity),
            by_volatile: AHashMap::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Register a descriptor and everything supplied inline with it
    ///
    /// An already-known `StableId` is merged into the existing instance; its
    /// identity never changes. Returns the (possibly pre-existing) node.
    pub fn register_node(&mut self, desc: &NodeDescriptor) -> Result<&MirrorNode> {
        validate_tree(desc)?;
        let id = self.register(desc, None)?;
        Ok(self.live(id))
    }

    /// Register a fresh document root, replacing everything
    pub fn load_root(&mut self, desc: &NodeDescriptor) -> Result<StableId> {
        validate_tree(desc)?;
        self.reset();
        let id = self.register(desc, None)?;
        self.root = Some(id);
        Ok(id)
    }

    pub fn root_id(&self) -> Option<StableId> {
        self.root
    }

    pub fn root(&self) -> Option<&MirrorNode> {
        self.root.and_then(|id| self.by_stable_id(id))
    }

    fn register(&mut self, desc: &NodeDescriptor, parent: Option<StableId>) -> Result<StableId> {
        let stable = desc.stable_id()?;
        let named_parent = match parent {
            Some(_) => None,
            None => desc
                .parent_id
                .map(VolatileId)
                .and_then(|v| self.by_volatile.get(&v).copied()),
        };
        let parent = parent.or(named_parent);

        match self.by_stable.get(&stable).copied() {
            Some(slot) => {
                let (old_volatile, old_classes, old_parent) = {
                    let node = self.slot(slot);
                    (node.volatile_id, class_list(node), node.parent)
                };

                let node = self.slot_mut(slot);
                node.update(desc)?;
                let new_volatile = node.volatile_id;
                let new_classes = class_list(node);

                self.reindex_classes(&old_classes, &new_classes);
                if old_volatile != new_volatile {
                    if let Some(old) = old_volatile {
                        self.unmap_volatile(old, stable);
                    }
                    if let Some(new) = new_volatile {
                        self.map_volatile(new, stable);
                    }
                }
                if let Some(parent) = parent {
                    if let Some(old_parent) = old_parent.filter(|&p| p != parent) {
                        self.detach_from(old_parent, stable);
                    }
                    self.slot_mut(slot).parent = Some(parent);
                }
            }
            None => {
                let mut node = MirrorNode::from_descriptor(desc)?;
                node.parent = parent;
                self.reindex_classes(&[], &class_list(&node));
                let volatile = node.volatile_id;

                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.slots[slot] = Some(node);
                        slot
                    }
                    None => {
                        self.slots.push(Some(node));
                        self.slots.len() - 1
                    }
                };
                self.by_stable.insert(stable, slot);
                if let Some(volatile) = volatile {
                    self.map_volatile(volatile, stable);
                }
            }
        }

        if let Some(parent) = named_parent {
            self.adopt(parent, stable);
        }

        if let Some(children) = &desc.children {
            self.link_children(stable, children)?;
        }

        if let Some(roots) = &desc.shadow_roots {
            let mut ids = smallvec::SmallVec::<[StableId; 2]>::new();
            for root in roots {
                let id = self.register(root, Some(stable))?;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            let old = std::mem::replace(&mut self.live_mut(stable).shadow_roots, ids.clone());
            for gone in old.into_iter().filter(|id| !ids.contains(id)) {
                self.remove_owned(stable, gone);
            }
        }

        if let Some(doc) = &desc.content_document {
            let doc_id = self.register(doc, Some(stable))?;
            let previous = match &mut self.live_mut(stable).kind {
                NodeKind::Frame(frame) => frame.content_document.replace(doc_id),
                _ => None,
            };
            if let Some(previous) = previous.filter(|&p| p != doc_id) {
                self.remove_owned(stable, previous);
            }
        }

        Ok(stable)
    }

    /// Replace `parent`'s children with `descs` (`DOM.setChildNodes`)
    ///
    /// Former children missing from the new list are removed with their
    /// subtrees. Returns `None` if the parent is unknown.
    pub fn replace_children(
        &mut self,
        parent: StableId,
        descs: &[NodeDescriptor],
    ) -> Result<Option<Vec<StableId>>> {
        if !self.contains(parent) {
            return Ok(None);
        }
        for desc in descs {
            validate_tree(desc)?;
        }
        self.link_children(parent, descs).map(Some)
    }

    fn link_children(&mut self, parent: StableId, descs: &[NodeDescriptor]) -> Result<Vec<StableId>> {
        let mut ids: Vec<StableId> = Vec::with_capacity(descs.len());
        for desc in descs {
            let id = self.register(desc, Some(parent))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let node = self.live_mut(parent);
        let old = std::mem::replace(&mut node.children, ids.iter().copied().collect());
        node.child_node_count = Some(ids.len() as u32);

        for gone in old.into_iter().filter(|id| !ids.contains(id)) {
            self.remove_owned(parent, gone);
        }
        Ok(ids)
    }

    /// Register `desc` and link it under `parent` at `at`
    ///
    /// An `After` anchor that is not among the parent's children appends.
    /// The payload is registered before it is linked. Returns `None` without
    /// registering anything if the parent is unknown.
    pub fn insert_child(&mut self, parent: StableId, desc: &NodeDescriptor, at: InsertAt) -> Result<Option<StableId>> {
        if !self.contains(parent) {
            return Ok(None);
        }
        validate_tree(desc)?;
        let child = self.register(desc, Some(parent))?;

        let node = self.live_mut(parent);
        let siblings: Vec<StableId> = node.children.iter().copied().filter(|&c| c != child).collect();
        let before = match at {
            InsertAt::First => siblings.first().copied(),
            InsertAt::Last => None,
            InsertAt::After(prev) => match siblings.iter().position(|&c| c == prev) {
                Some(pos) => siblings.get(pos + 1).copied(),
                None => {
                    tracing::debug!(%parent, %prev, "insert anchor unknown, appending");
                    None
                }
            },
        };
        node.add_child(child, before);
        node.child_node_count = Some(node.children.len() as u32);
        Ok(Some(child))
    }

    /// Register `desc` as a shadow root of `host`
    pub fn attach_shadow_root(
        &mut self,
        host: StableId,
        desc: &NodeDescriptor,
    ) -> Result<Option<StableId>> {
        if !self.contains(host) {
            return Ok(None);
        }
        validate_tree(desc)?;
        let root = self.register(desc, Some(host))?;
        let node = self.live_mut(host);
        if !node.shadow_roots.contains(&root) {
            node.shadow_roots.push(root);
        }
        Ok(Some(root))
    }

    /// Remove a node and everything it owns
    ///
    /// Detaches it from its parent's children, shadow roots, or frame
    /// content document. Returns `false` if it was already gone.
    pub fn remove_node(&mut self, id: StableId) -> bool {
        let Some(parent) = self.by_stable_id(id).map(|n| n.parent) else {
            return false;
        };
        if let Some(parent) = parent {
            self.detach_from(parent, id);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        self.remove_subtree(id);
        true
    }

    /// Remove `id` only if `owner` still owns it
    fn remove_owned(&mut self, owner: StableId, id: StableId) {
        if self.by_stable_id(id).and_then(|n| n.parent) == Some(owner) {
            self.remove_subtree(id);
        }
    }

    /// Remember an unlisted child so removing `parent` also removes it
    fn adopt(&mut self, parent: StableId, child: StableId) {
        let listed = self
            .by_stable_id(parent)
            .map_or(true, |p| p.owned_ids().any(|id| id == child));
        if listed {
            return;
        }
        let adopted = self.adopted.entry(parent).or_default();
        if !adopted.contains(&child) {
            adopted.push(child);
        }
    }

    fn detach_from(&mut self, parent: StableId, id: StableId) {
        if let Some(adopted) = self.adopted.get_mut(&parent) {
            adopted.retain(|a| *a != id);
        }
        let Some(node) = self.get_mut(parent) else {
            return;
        };
        if node.remove_child(id) {
            node.child_node_count = Some(node.children.len() as u32);
        }
        node.shadow_roots.retain(|r| *r != id);
        if let NodeKind::Frame(frame) = &mut node.kind {
            if frame.content_document == Some(id) {
                frame.content_document = None;
            }
        }
    }

    /// Iterative, so deep documents cannot overflow the stack
    fn remove_subtree(&mut self, id: StableId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(slot) = self.by_stable.remove(&id) else {
                continue;
            };
            let Some(node) = self.slots[slot].take() else {
                continue;
            };
            self.free.push(slot);
            if let Some(volatile) = node.volatile_id {
                self.unmap_volatile(volatile, id);
            }
            self.reindex_classes(&class_list(&node), &[]);

            let adopted = self.adopted.remove(&id).unwrap_or_default();
            for owned in node.owned_ids().chain(adopted) {
                if self.by_stable_id(owned).and_then(|n| n.parent) == Some(id) {
                    stack.push(owned);
                }
            }
        }
    }

    /// Drop everything; used on full-document reload
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_stable.clear();
        self.by_volatile.clear();
        self.classes.clear();
        self.adopted.clear();
        self.root = None;
    }

    pub fn by_stable_id(&self, id: StableId) -> Option<&MirrorNode> {
        self.by_stable
            .get(&id)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn by_volatile_id(&self, id: VolatileId) -> Option<&MirrorNode> {
        self.by_volatile
            .get(&id)
            .and_then(|&stable| self.by_stable_id(stable))
    }

    /// Translate an RPC handle into the identity safe to keep
    pub fn stable_for(&self, id: VolatileId) -> Option<StableId> {
        self.by_volatile.get(&id).copied()
    }

    pub(crate) fn get_mut(&mut self, id: StableId) -> Option<&mut MirrorNode> {
        let slot = *self.by_stable.get(&id)?;
        self.slots[slot].as_mut()
    }

    pub fn contains(&self, id: StableId) -> bool {
        self.by_stable.contains_key(&id)
    }

    /// Record a volatile id learned outside a descriptor
    pub fn set_volatile_id(&mut self, id: StableId, volatile: VolatileId) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        let old = node.volatile_id.replace(volatile);
        if let Some(old) = old.filter(|&o| o != volatile) {
            self.unmap_volatile(old, id);
        }
        self.map_volatile(volatile, id);
        true
    }

    pub fn set_attribute(&mut self, id: StableId, name: &str, value: &str) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        if !node.is_element() {
            return false;
        }
        let old = class_list(node);
        node.set_attribute(name, value);
        if name == "class" {
            let new = class_list(node);
            self.reindex_classes(&old, &new);
        }
        true
    }

    pub fn remove_attribute(&mut self, id: StableId, name: &str) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        let old = class_list(node);
        let removed = node.remove_attribute(name).is_some();
        if removed && name == "class" {
            self.reindex_classes(&old, &[]);
        }
        removed
    }

    pub fn set_text(&mut self, id: StableId, value: &str) -> bool {
        self.get_mut(id).is_some_and(|node| node.set_text(value))
    }

    pub fn set_child_node_count(&mut self, id: StableId, count: u32) -> bool {
        self.get_mut(id)
            .map(|node| node.child_node_count = Some(count))
            .is_some()
    }

    pub fn set_distributed_nodes(&mut self, id: StableId, nodes: &[StableId]) -> bool {
        match self.get_mut(id).and_then(|n| n.element_mut()) {
            Some(el) => {
                el.distributed_nodes = nodes.iter().copied().collect();
                true
            }
            None => false,
        }
    }

    /// Best-effort selector, cached on the element until its attributes change
    pub fn selector_hint(&mut self, id: StableId) -> Option<String> {
        if let Some(cached) = self
            .by_stable_id(id)
            .and_then(|n| n.element())
            .and_then(|el| el.selector_hint.clone())
        {
            return Some(cached);
        }
        let hint = selector::compute_selector_hint(self, id)?;
        if let Some(el) = self.get_mut(id).and_then(|n| n.element_mut()) {
            el.selector_hint = Some(hint.clone());
        }
        Some(hint)
    }

    /// Number of live nodes carrying `class`
    pub fn class_usage(&self, class: &str) -> usize {
        self.classes.get(class).copied().unwrap_or(0)
    }

    /// Total number of live nodes
    pub fn len(&self) -> usize {
        self.by_stable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stable.is_empty()
    }

    /// Number of nodes that have a volatile id
    pub fn volatile_len(&self) -> usize {
        self.by_volatile.len()
    }

    /// Arena slots ever allocated (live or free)
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterator over all live nodes, in arena order
    pub fn iter(&self) -> impl Iterator<Item = &MirrorNode> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Children of a node, in DOM order
    pub fn children(&self, id: StableId) -> Vec<&MirrorNode> {
        self.by_stable_id(id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|&c| self.by_stable_id(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent(&self, id: StableId) -> Option<&MirrorNode> {
        self.by_stable_id(id)
            .and_then(|n| n.parent)
            .and_then(|p| self.by_stable_id(p))
    }

    /// Traverse light children depth-first (iterative, no recursion)
    pub fn traverse_df<F>(&self, start: StableId, mut visit: F) -> Result<()>
    where
        F: FnMut(&MirrorNode) -> Result<()>,
    {
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            let Some(node) = self.by_stable_id(id) else {
                continue;
            };
            visit(node)?;

            // Push children in reverse order (so they're visited left-to-right)
            stack.extend(node.children.iter().rev().copied());
        }

        Ok(())
    }

    /// Find nodes matching predicate
    pub fn find<F>(&self, predicate: F) -> Vec<StableId>
    where
        F: Fn(&MirrorNode) -> bool,
    {
        self.iter()
            .filter(|node| predicate(node))
            .map(|node| node.stable_id)
            .collect()
    }

    pub fn find_one<F>(&self, predicate: F) -> Option<StableId>
    where
        F: Fn(&MirrorNode) -> bool,
    {
        self.iter().find(|node| predicate(node)).map(|node| node.stable_id)
    }

    /// Elements with this tag name, matched case-insensitively
    pub fn find_by_tag(&self, tag: &str) -> Vec<StableId> {
        self.find(|node| node.tag_name().is_some_and(|t| t.eq_ignore_ascii_case(tag)))
    }

    /// Element by ID attribute
    pub fn find_by_id(&self, id: &str) -> Option<StableId> {
        self.find_one(|node| node.attr("id") == Some(id))
    }

    fn map_volatile(&mut self, volatile: VolatileId, stable: StableId) {
        if let Some(prev) = self.by_volatile.insert(volatile, stable) {
            if prev != stable {
                // The handle was reassigned; the old holder no longer owns it
                if let Some(node) = self.get_mut(prev) {
                    if node.volatile_id == Some(volatile) {
                        node.volatile_id = None;
                    }
                }
            }
        }
    }

    fn unmap_volatile(&mut self, volatile: VolatileId, stable: StableId) {
        if self.by_volatile.get(&volatile) == Some(&stable) {
            self.by_volatile.remove(&volatile);
        }
    }

    fn reindex_classes(&mut self, old: &[String], new: &[String]) {
        for class in old {
            if let Some(count) = self.classes.get_mut(class) {
                *count -= 1;
                if *count == 0 {
                    self.classes.remove(class);
                }
            }
        }
        for class in new {
            *self.classes.entry(class.clone()).or_insert(0) += 1;
        }
    }

    fn slot(&self, slot: usize) -> &MirrorNode {
        match &self.slots[slot] {
            Some(node) => node,
            None => unreachable!("indexed slot {} is empty", slot),
        }
    }

    fn slot_mut(&mut self, slot: usize) -> &mut MirrorNode {
        match &mut self.slots[slot] {
            Some(node) => node,
            None => unreachable!("indexed slot {} is empty", slot),
        }
    }

    /// Node that was just registered under `id`
    fn live(&self, id: StableId) -> &MirrorNode {
        self.slot(self.by_stable[&id])
    }

    fn live_mut(&mut self, id: StableId) -> &mut MirrorNode {
        let slot = self.by_stable[&id];
        self.slot_mut(slot)
    }

    /// Panics with a description of the first broken invariant
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (volatile, stable) in &self.by_volatile {
            let node = self
                .by_stable_id(*stable)
                .unwrap_or_else(|| panic!("{} maps to unregistered {}", volatile, stable));
            assert_eq!(node.volatile_id, Some(*volatile), "{} index disagrees", stable);
        }
        for node in self.iter() {
            assert_eq!(self.by_stable.get(&node.stable_id).map(|&s| self.slot(s).stable_id), Some(node.stable_id));
            for owned in node.owned_ids() {
                assert!(self.contains(owned), "{} links to missing {}", node.stable_id, owned);
            }
            if let Some(parent) = node.parent {
                assert!(self.contains(parent), "{} names removed parent {}", node.stable_id, parent);
            }
        }
        let live: usize = self.slots.iter().filter(|s| s.is_some()).count();
        assert_eq!(live, self.by_stable.len());
    }
}

/// Reject a payload before any of it touches the registry
fn validate_tree(desc: &NodeDescriptor) -> Result<()> {
    let mut stack = vec![desc];
    while let Some(desc) = stack.pop() {
        desc.identity()?;
        stack.extend(desc.children.iter().flatten());
        stack.extend(desc.shadow_roots.iter().flatten());
        stack.extend(desc.content_document.as_deref());
    }
    Ok(())
}
