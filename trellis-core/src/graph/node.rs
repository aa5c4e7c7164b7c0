//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::reactive::{EffectClass, ScopeId};

/// Unique identifier for a node in the dependency graph.
///
/// The slot indexes the registry arena; the serial is never reused, so a
/// stale id cannot alias a node that later took over the same slot.
/// Ordering follows the serial, which is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    slot: usize,
    serial: u64,
}

impl NodeId {
    pub(crate) fn new(slot: usize, serial: u64) -> Self {
        Self { slot, serial }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Get the creation serial of this node.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.serial.cmp(&other.serial)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// A writable source. Has dependents, never dependencies.
    Signal,

    /// A cached derived value. Has dependencies and may have dependents.
    Computed,

    /// A writable derived value that resets when its source changes identity.
    Linked,

    /// A side-effecting consumer. Has dependencies but no dependents.
    Effect,
}

impl NodeKind {
    /// Whether nodes of this kind record dependencies while they run.
    pub fn is_consumer(&self) -> bool {
        !matches!(self, NodeKind::Signal)
    }
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// A transitive producer changed. The node must compare the versions of
    /// its direct producers before deciding to recompute.
    MaybeDirty,

    /// A direct producer changed, or the node never ran.
    Dirty,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    owner: ScopeId,
    class: Option<EffectClass>,
    dirty: DirtyState,

    /// Incremented on every accepted value change.
    version: u64,

    /// Producers read during the last run, with the version observed.
    dependencies: IndexMap<NodeId, u64>,

    /// Consumers that read this node during their last run.
    dependents: IndexSet<NodeId>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, owner: ScopeId, class: Option<EffectClass>) -> Self {
        Self {
            id,
            kind,
            owner,
            class,
            dirty: match kind {
                NodeKind::Signal => DirtyState::Clean,
                // Consumers start dirty so the first read or run computes.
                NodeKind::Computed | NodeKind::Linked | NodeKind::Effect => DirtyState::Dirty,
            },
            version: 0,
            dependencies: IndexMap::new(),
            dependents: IndexSet::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Scope that owns this node.
    pub fn owner(&self) -> ScopeId {
        self.owner
    }

    /// Scheduling class, for effect nodes.
    pub fn class(&self) -> Option<EffectClass> {
        self.class
    }

    /// Get the current dirty state.
    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Mark the node as maybe dirty. Never downgrades a dirty node.
    pub(crate) fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub(crate) fn add_dependency(&mut self, node_id: NodeId, version: u64) {
        self.dependencies.insert(node_id, version);
    }

    pub(crate) fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.shift_remove(&node_id);
    }

    pub(crate) fn set_dependencies(&mut self, dependencies: IndexMap<NodeId, u64>) {
        self.dependencies = dependencies;
    }

    /// Producers this node read during its last run, in read order.
    pub fn dependencies(&self) -> &IndexMap<NodeId, u64> {
        &self.dependencies
    }

    pub(crate) fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    /// Consumers that read this node during their last run.
    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: NodeKind) -> Node {
        Node::new(NodeId::new(0, 0), kind, ScopeId::ROOT, None)
    }

    #[test]
    fn signal_node_starts_clean() {
        let node = node(NodeKind::Signal);
        assert_eq!(node.kind(), NodeKind::Signal);
        assert!(node.is_clean());
        assert_eq!(node.version(), 0);
    }

    #[test]
    fn consumer_nodes_start_dirty() {
        for kind in [NodeKind::Computed, NodeKind::Linked, NodeKind::Effect] {
            assert_eq!(node(kind).dirty_state(), DirtyState::Dirty);
            assert!(kind.is_consumer());
        }
        assert!(!NodeKind::Signal.is_consumer());
    }

    #[test]
    fn dependency_management() {
        let mut node = node(NodeKind::Computed);
        let dep1 = NodeId::new(1, 1);
        let dep2 = NodeId::new(2, 2);

        node.add_dependency(dep1, 3);
        node.add_dependency(dep2, 0);

        assert_eq!(node.dependencies().get(&dep1), Some(&3));
        assert_eq!(node.dependencies().len(), 2);

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains_key(&dep1));
        assert_eq!(node.dependencies().keys().copied().collect::<Vec<_>>(), vec![dep2]);
    }

    #[test]
    fn dirty_state_transitions() {
        let mut node = node(NodeKind::Computed);
        assert_eq!(node.dirty_state(), DirtyState::Dirty);

        // Maybe-dirty never downgrades a dirty node
        node.mark_maybe_dirty();
        assert_eq!(node.dirty_state(), DirtyState::Dirty);

        node.mark_clean();
        node.mark_maybe_dirty();
        assert_eq!(node.dirty_state(), DirtyState::MaybeDirty);

        node.mark_dirty();
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn ids_order_by_serial() {
        let early = NodeId::new(7, 1);
        let late = NodeId::new(0, 2);
        assert!(early < late);
        assert_eq!(late.to_string(), "#2");
    }
}
