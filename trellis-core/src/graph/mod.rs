//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between reactive values and the computations that read them.
//!
//! # Overview
//!
//! The graph is expected to be acyclic:
//!
//! - Nodes represent signals, computed values, linked values and effects
//! - Edges represent dependencies: if A read B, there is an edge from B to A
//!
//! When a signal changes, we traverse the graph to find all affected nodes
//! and mark them dirty. Consumers decide on their next read (or the next
//! effect flush) whether they actually need to recompute.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a single arena per runtime. Two runtimes never share
//!    nodes, which keeps tests independent.
//!
//! 2. Each consumer's edge set is rebuilt wholesale after every successful
//!    run, so conditional reads never leave stale edges behind.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod registry;

pub use node::{DirtyState, Node, NodeId, NodeKind};
pub use registry::{DirtiedEffects, NodeRegistry};
