//! Node Registry
//!
//! The registry owns every node of one runtime and the edges between them.
//!
//! # Algorithm
//!
//! Propagation after a write is push-only:
//!
//! 1. Mark the written node's direct dependents as "dirty"
//! 2. Mark everything reachable beyond them as "maybe dirty"
//! 3. Report the effect nodes that were reached so they can be queued
//!
//! Nothing recomputes here. Maybe-dirty consumers later compare the
//! versions they observed against their producers' current versions and
//! only recompute when one of them moved.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use slab::Slab;
use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind};
use crate::reactive::{EffectClass, ScopeId};

/// Effect nodes reached by one propagation pass.
pub type DirtiedEffects = SmallVec<[NodeId; 8]>;

/// Arena of graph nodes, indexed by [`NodeId`].
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Slab<Node>,
    next_serial: u64,
}

impl NodeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node and return its id.
    pub fn insert(&mut self, kind: NodeKind, owner: ScopeId, class: Option<EffectClass>) -> NodeId {
        let serial = self.next_serial;
        self.next_serial += 1;

        let entry = self.nodes.vacant_entry();
        let id = NodeId::new(entry.key(), serial);
        entry.insert(Node::new(id, kind, owner, class));
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node.
    pub fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        self.get(node_id)?;
        let node = self.nodes.remove(node_id.slot());

        for dep_id in node.dependencies().keys() {
            if let Some(dep) = self.get_mut(*dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        for dependent_id in node.dependents() {
            if let Some(dependent) = self.get_mut(*dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    /// Get a reference to a node.
    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes
            .get(node_id.slot())
            .filter(|node| node.id() == node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(node_id.slot())
            .filter(|node| node.id() == node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    pub fn version(&self, node_id: NodeId) -> Option<u64> {
        self.get(node_id).map(Node::version)
    }

    /// Add a dependency edge: `consumer` read `producer` at `version`.
    pub fn add_edge(&mut self, producer: NodeId, consumer: NodeId, version: u64) {
        if !self.contains(producer) || !self.contains(consumer) {
            return;
        }
        if let Some(producer_node) = self.get_mut(producer) {
            producer_node.add_dependent(consumer);
        }
        if let Some(consumer_node) = self.get_mut(consumer) {
            consumer_node.add_dependency(producer, version);
        }
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, producer: NodeId, consumer: NodeId) {
        if let Some(producer_node) = self.get_mut(producer) {
            producer_node.remove_dependent(consumer);
        }
        if let Some(consumer_node) = self.get_mut(consumer) {
            consumer_node.remove_dependency(producer);
        }
    }

    /// Replace the consumer's dependency set with the one observed in its
    /// latest run. Edges to producers that were not read again are dropped.
    pub fn replace_dependencies(&mut self, consumer: NodeId, observed: IndexMap<NodeId, u64>) {
        let stale: SmallVec<[NodeId; 8]> = match self.get(consumer) {
            Some(node) => node
                .dependencies()
                .keys()
                .filter(|dep| !observed.contains_key(*dep))
                .copied()
                .collect(),
            None => return,
        };

        for producer in stale {
            if let Some(producer_node) = self.get_mut(producer) {
                producer_node.remove_dependent(consumer);
            }
        }

        let mut kept = IndexMap::with_capacity(observed.len());
        for (producer, version) in observed {
            if let Some(producer_node) = self.get_mut(producer) {
                producer_node.add_dependent(consumer);
                kept.insert(producer, version);
            }
        }

        tracing::trace!(node = %consumer, dependencies = kept.len(), "rebuilt dependencies");
        if let Some(node) = self.get_mut(consumer) {
            node.set_dependencies(kept);
        }
    }

    /// Add the observed edges to the consumer's dependency set, keeping
    /// every previous edge. Used after a failed run.
    pub fn merge_dependencies(&mut self, consumer: NodeId, observed: IndexMap<NodeId, u64>) {
        for (producer, version) in observed {
            self.add_edge(producer, consumer, version);
        }
    }

    /// Propagate a change of `source` to everything downstream.
    ///
    /// Returns the effect nodes that were reached.
    pub fn mark_changed(&mut self, source_id: NodeId) -> DirtiedEffects {
        let mut effects = DirtiedEffects::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(source) = self.get(source_id) {
            for dependent_id in source.dependents() {
                queue.push_back((*dependent_id, true));
            }
        }

        // Direct dependents are all queued first, so a node reachable both
        // directly and transitively is popped as direct.
        while let Some((node_id, direct)) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            let Some(node) = self.get_mut(node_id) else {
                continue;
            };
            if direct {
                node.mark_dirty();
            } else {
                node.mark_maybe_dirty();
            }
            if node.kind() == NodeKind::Effect {
                effects.push(node_id);
            }

            for dependent_id in node.dependents() {
                queue.push_back((*dependent_id, false));
            }
        }

        tracing::debug!(node = %source_id, dirtied = visited.len(), "propagated change");
        effects
    }

    pub fn mark_clean(&mut self, node_id: NodeId) {
        if let Some(node) = self.get_mut(node_id) {
            node.mark_clean();
        }
    }

    pub fn bump_version(&mut self, node_id: NodeId) {
        if let Some(node) = self.get_mut(node_id) {
            node.bump_version();
        }
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the total number of producer -> consumer edges.
    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|(_, node)| node.dependencies().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::DirtyState;

    fn insert(registry: &mut NodeRegistry, kind: NodeKind) -> NodeId {
        let id = registry.insert(kind, ScopeId::ROOT, None);
        registry.mark_clean(id);
        id
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut registry = NodeRegistry::new();

        let id1 = insert(&mut registry, NodeKind::Signal);
        let id2 = insert(&mut registry, NodeKind::Computed);
        assert_eq!(registry.node_count(), 2);

        registry.remove(id1);
        assert_eq!(registry.node_count(), 1);
        assert!(registry.get(id1).is_none());
        assert!(registry.get(id2).is_some());
    }

    #[test]
    fn reused_slot_does_not_alias_stale_id() {
        let mut registry = NodeRegistry::new();

        let old = insert(&mut registry, NodeKind::Signal);
        registry.remove(old);
        let new = insert(&mut registry, NodeKind::Signal);

        assert_eq!(old.slot(), new.slot());
        assert!(registry.get(old).is_none());
        assert!(registry.get(new).is_some());
        assert!(old < new);
    }

    #[test]
    fn add_and_remove_edges() {
        let mut registry = NodeRegistry::new();
        let source_id = insert(&mut registry, NodeKind::Signal);
        let derived_id = insert(&mut registry, NodeKind::Computed);

        registry.add_edge(source_id, derived_id, 0);
        assert!(registry.get(source_id).unwrap().dependents().contains(&derived_id));
        assert!(registry.get(derived_id).unwrap().dependencies().contains_key(&source_id));
        assert_eq!(registry.edge_count(), 1);

        registry.remove_edge(source_id, derived_id);
        assert!(registry.get(source_id).unwrap().dependents().is_empty());
        assert!(registry.get(derived_id).unwrap().dependencies().is_empty());
    }

    #[test]
    fn removing_node_unlinks_edges() {
        let mut registry = NodeRegistry::new();
        let source_id = insert(&mut registry, NodeKind::Signal);
        let derived_id = insert(&mut registry, NodeKind::Computed);
        let effect_id = insert(&mut registry, NodeKind::Effect);

        registry.add_edge(source_id, derived_id, 0);
        registry.add_edge(derived_id, effect_id, 0);

        registry.remove(derived_id);
        assert!(registry.get(source_id).unwrap().dependents().is_empty());
        assert!(registry.get(effect_id).unwrap().dependencies().is_empty());
        assert_eq!(registry.edge_count(), 0);
    }

    #[test]
    fn replace_dependencies_drops_stale_edges() {
        let mut registry = NodeRegistry::new();
        let a = insert(&mut registry, NodeKind::Signal);
        let b = insert(&mut registry, NodeKind::Signal);
        let consumer = insert(&mut registry, NodeKind::Computed);

        registry.add_edge(a, consumer, 0);
        registry.add_edge(b, consumer, 0);

        let mut observed = IndexMap::new();
        observed.insert(b, 4);
        registry.replace_dependencies(consumer, observed);

        assert!(registry.get(a).unwrap().dependents().is_empty());
        assert!(registry.get(b).unwrap().dependents().contains(&consumer));
        assert_eq!(registry.get(consumer).unwrap().dependencies().get(&b), Some(&4));
        assert_eq!(registry.edge_count(), 1);
    }

    #[test]
    fn merge_dependencies_keeps_previous_edges() {
        let mut registry = NodeRegistry::new();
        let a = insert(&mut registry, NodeKind::Signal);
        let b = insert(&mut registry, NodeKind::Signal);
        let consumer = insert(&mut registry, NodeKind::Computed);

        registry.add_edge(a, consumer, 0);
        let mut observed = IndexMap::new();
        observed.insert(b, 0);
        registry.merge_dependencies(consumer, observed);

        assert_eq!(registry.edge_count(), 2);
    }

    #[test]
    fn mark_changed_propagates() {
        let mut registry = NodeRegistry::new();

        // source -> derived1 -> derived2 -> effect
        let source_id = insert(&mut registry, NodeKind::Signal);
        let derived1_id = insert(&mut registry, NodeKind::Computed);
        let derived2_id = insert(&mut registry, NodeKind::Computed);
        let effect_id = insert(&mut registry, NodeKind::Effect);

        registry.add_edge(source_id, derived1_id, 0);
        registry.add_edge(derived1_id, derived2_id, 0);
        registry.add_edge(derived2_id, effect_id, 0);

        let effects = registry.mark_changed(source_id);

        assert_eq!(effects.as_slice(), &[effect_id]);
        assert_eq!(registry.get(derived1_id).unwrap().dirty_state(), DirtyState::Dirty);
        assert_eq!(registry.get(derived2_id).unwrap().dirty_state(), DirtyState::MaybeDirty);
        assert_eq!(registry.get(effect_id).unwrap().dirty_state(), DirtyState::MaybeDirty);
        assert!(registry.get(source_id).unwrap().is_clean());
    }

    #[test]
    fn direct_edge_wins_over_transitive_path() {
        let mut registry = NodeRegistry::new();
        let source = insert(&mut registry, NodeKind::Signal);
        let middle = insert(&mut registry, NodeKind::Computed);
        let effect = insert(&mut registry, NodeKind::Effect);

        registry.add_edge(source, middle, 0);
        registry.add_edge(middle, effect, 0);
        registry.add_edge(source, effect, 0);

        registry.mark_changed(source);
        assert_eq!(registry.get(effect).unwrap().dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn propagation_continues_through_dirty_nodes() {
        let mut registry = NodeRegistry::new();
        let source = insert(&mut registry, NodeKind::Signal);
        let derived = insert(&mut registry, NodeKind::Computed);
        let effect = insert(&mut registry, NodeKind::Effect);

        registry.add_edge(source, derived, 0);
        registry.add_edge(derived, effect, 0);
        registry.get_mut(derived).unwrap().mark_dirty();

        let effects = registry.mark_changed(source);
        assert_eq!(effects.as_slice(), &[effect]);
    }
}
