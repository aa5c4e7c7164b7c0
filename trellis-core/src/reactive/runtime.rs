//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computed
//! values, linked values and effects. It owns the dependency graph, the
//! tracking stack, the scope tree and the effect queue.
//!
//! # How It Works
//!
//! 1. Every primitive is created through a [`Scope`] and registers a node
//!    with the runtime.
//!
//! 2. When a computation reads a node, the runtime records the dependency
//!    on the frame at the top of the tracking stack and adds the edge.
//!
//! 3. When a value changes, the runtime:
//!    a. Bumps the node's version
//!    b. Marks direct dependents dirty and transitive ones maybe dirty
//!    c. Queues reached effects for the next [`Runtime::flush`]
//!    d. Leaves computed values alone; they recompute on next access
//!
//! # Threading
//!
//! A runtime is single-threaded. Several runtimes can coexist in one thread
//! (or one test binary) without seeing each other's nodes or frames.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::context::{FrameKind, Tracker, TrackingGuard};
use super::effect::EffectSlot;
use super::scheduler::{self, EffectScheduler, FlushReport};
use super::scope::{Scope, ScopeId, ScopeTree};
use crate::config::RuntimeConfig;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtiedEffects, DirtyState, NodeId, NodeKind, NodeRegistry};

use super::EffectClass;

/// A node that can bring its cached value up to date on demand.
///
/// Consumers in the maybe-dirty state call this on each of their producers
/// before comparing versions.
pub(crate) trait Reactive {
    fn node_id(&self) -> NodeId;

    fn refresh(&self) -> Result<()>;
}

/// Snapshot of the graph's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub scopes: usize,
    pub pending_effects: usize,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    graph: RefCell<NodeRegistry>,
    tracker: Tracker,
    scopes: RefCell<ScopeTree>,
    producers: RefCell<HashMap<NodeId, Rc<dyn Reactive>>>,
    scheduler: RefCell<EffectScheduler>,
}

/// Handle to one reactive graph.
///
/// Cloning the handle is cheap; all clones refer to the same graph.
///
/// Nodes keep the runtime alive and the runtime keeps nodes alive until
/// their scope is disposed. Call [`Runtime::dispose`] when the graph is no
/// longer needed.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                graph: RefCell::new(NodeRegistry::new()),
                tracker: Tracker::default(),
                scopes: RefCell::new(ScopeTree::new()),
                producers: RefCell::new(HashMap::new()),
                scheduler: RefCell::new(EffectScheduler::default()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The application-wide scope. Effects created here run in the `Root`
    /// class.
    pub fn root(&self) -> Scope {
        Scope::new(self.clone(), ScopeId::ROOT)
    }

    /// Run `f` without recording any of its reads as dependencies.
    ///
    /// The previous tracking frame is restored afterward, even if `f` panics.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.tracker.enter_untracked();
        f()
    }

    /// Check if reads are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracker.is_tracking()
    }

    /// Fail with [`ReactiveError::ContextViolation`] when called while a
    /// computed value derives or an effect body runs.
    pub fn assert_not_in_reactive_context(&self, operation: &'static str) -> Result<()> {
        if self.inner.tracker.is_tracking() {
            return Err(ReactiveError::ContextViolation { operation });
        }
        Ok(())
    }

    /// Run every pending effect.
    ///
    /// All pending `Root` effects run (in creation order) before any `View`
    /// effect; `View` effects run parent scope first. Effects dirtied while
    /// the flush runs are picked up by the same flush.
    pub fn flush(&self) -> Result<FlushReport> {
        scheduler::flush(self)
    }

    /// Number of effects waiting for the next flush.
    pub fn pending_effects(&self) -> usize {
        self.inner.scheduler.borrow().pending_len()
    }

    pub fn stats(&self) -> GraphStats {
        let graph = self.inner.graph.borrow();
        GraphStats {
            nodes: graph.node_count(),
            edges: graph.edge_count(),
            scopes: self.inner.scopes.borrow().len(),
            pending_effects: self.pending_effects(),
        }
    }

    /// Producers `node` read during its last run, in read order.
    pub fn dependencies_of(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .borrow()
            .get(node)
            .map(|n| n.dependencies().keys().copied().collect())
            .unwrap_or_default()
    }

    /// Consumers that read `node` during their last run.
    pub fn dependents_of(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .borrow()
            .get(node)
            .map(|n| n.dependents().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn version_of(&self, node: NodeId) -> Option<u64> {
        self.inner.graph.borrow().version(node)
    }

    pub fn dirty_state_of(&self, node: NodeId) -> Option<DirtyState> {
        self.inner.graph.borrow().get(node).map(|n| n.dirty_state())
    }

    /// Whether `node` is still alive.
    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.graph.borrow().contains(node)
    }

    /// Dispose the root scope and everything it owns.
    pub fn dispose(&self) {
        self.dispose_scope(ScopeId::ROOT);
    }

    // ------------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------------

    pub(crate) fn enter(&self, consumer: NodeId, kind: FrameKind) -> TrackingGuard<'_> {
        self.inner.tracker.enter(consumer, kind)
    }

    pub(crate) fn scopes(&self) -> Ref<'_, ScopeTree> {
        self.inner.scopes.borrow()
    }

    pub(crate) fn scheduler(&self) -> &RefCell<EffectScheduler> {
        &self.inner.scheduler
    }

    pub(crate) fn owner_of(&self, node: NodeId) -> Option<ScopeId> {
        self.inner.graph.borrow().get(node).map(|n| n.owner())
    }

    /// Allocate a node owned by `owner`.
    ///
    /// A node created in a disposed scope is removed again right away; its
    /// handle behaves like any other disposed handle.
    pub(crate) fn create_node(
        &self,
        kind: NodeKind,
        owner: ScopeId,
        class: Option<EffectClass>,
    ) -> NodeId {
        let id = self.inner.graph.borrow_mut().insert(kind, owner, class);
        let adopted = self.inner.scopes.borrow_mut().adopt(owner, id);
        if !adopted {
            self.inner.graph.borrow_mut().remove(id);
        }
        tracing::trace!(node = %id, ?kind, scope = %owner, adopted, "created node");
        id
    }

    pub(crate) fn register_producer(&self, producer: Rc<dyn Reactive>) {
        let id = producer.node_id();
        if self.contains(id) {
            self.inner.producers.borrow_mut().insert(id, producer);
        }
    }

    pub(crate) fn register_effect(&self, slot: Rc<EffectSlot>) {
        self.inner.scheduler.borrow_mut().register(slot);
    }

    /// Record a read of `node` for the consumer on top of the stack.
    pub(crate) fn track(&self, node: NodeId) {
        let Some(version) = self.version_of(node) else {
            return;
        };
        if let Some(consumer) = self.inner.tracker.record(node, version) {
            self.inner.graph.borrow_mut().add_edge(node, consumer, version);
        }
    }

    /// Reject writes to disposed nodes and writes during a derivation.
    pub(crate) fn check_write(&self, node: NodeId) -> Result<()> {
        if !self.contains(node) {
            return Err(ReactiveError::Disposed(node));
        }
        if let Some(computation) = self.inner.tracker.flag_write(node) {
            return Err(ReactiveError::WriteDuringComputation {
                signal: node,
                computation,
            });
        }
        Ok(())
    }

    /// Publish an accepted change of `node`: bump its version, mark
    /// everything downstream and queue the effects that were reached.
    pub(crate) fn commit_write(&self, node: NodeId) {
        let effects: DirtiedEffects = {
            let mut graph = self.inner.graph.borrow_mut();
            graph.bump_version(node);
            graph.mark_changed(node)
        };
        self.inner.scheduler.borrow_mut().enqueue(effects);
    }

    pub(crate) fn bump_version(&self, node: NodeId) {
        self.inner.graph.borrow_mut().bump_version(node);
    }

    pub(crate) fn mark_clean(&self, node: NodeId) {
        self.inner.graph.borrow_mut().mark_clean(node);
    }

    /// Store the reads of a finished run. A successful run replaces the
    /// dependency set; a failed one only adds to it.
    pub(crate) fn finish_run(&self, consumer: NodeId, observed: indexmap::IndexMap<NodeId, u64>, ok: bool) {
        let mut graph = self.inner.graph.borrow_mut();
        if ok {
            graph.replace_dependencies(consumer, observed);
        } else {
            graph.merge_dependencies(consumer, observed);
        }
    }

    /// Whether any producer of `consumer` moved past the version observed in
    /// the consumer's last run. Computed and linked producers are refreshed
    /// first so their versions are current.
    pub(crate) fn producers_changed(&self, consumer: NodeId) -> bool {
        let dependencies: Vec<(NodeId, u64)> = match self.inner.graph.borrow().get(consumer) {
            Some(node) => node
                .dependencies()
                .iter()
                .map(|(id, version)| (*id, *version))
                .collect(),
            None => return true,
        };

        for (producer, seen) in dependencies {
            let refresher = self.inner.producers.borrow().get(&producer).cloned();
            if let Some(refresher) = refresher {
                if refresher.refresh().is_err() {
                    return true;
                }
            }
            if self.version_of(producer) != Some(seen) {
                return true;
            }
        }
        false
    }

    /// Create a scope under `parent`.
    pub(crate) fn create_scope(&self, parent: ScopeId) -> ScopeId {
        self.inner.scopes.borrow_mut().create(parent)
    }

    /// Register a callback to run when `scope` is disposed. Runs it at once
    /// if the scope is already gone.
    pub(crate) fn on_scope_cleanup(&self, scope: ScopeId, cleanup: Box<dyn FnOnce()>) {
        let rejected = self.inner.scopes.borrow_mut().on_cleanup(scope, cleanup);
        if let Err(cleanup) = rejected {
            cleanup();
        }
    }

    /// Tear down `scope`: child scopes first, then owned nodes, then cleanup
    /// callbacks, each most recent first.
    pub(crate) fn dispose_scope(&self, scope: ScopeId) {
        let Some(entry) = self.inner.scopes.borrow_mut().detach(scope) else {
            return;
        };
        tracing::debug!(scope = %scope, nodes = entry.nodes.len(), "disposing scope");

        for child in entry.children.into_iter().rev() {
            self.dispose_scope(child);
        }
        for node in entry.nodes.into_iter().rev() {
            self.dispose_node(node);
        }
        for cleanup in entry.cleanups.into_iter().rev() {
            cleanup();
        }
    }

    /// Remove a single node and its edges. Effects run their last cleanup.
    pub(crate) fn dispose_node(&self, node: NodeId) {
        if let Some(owner) = self.owner_of(node) {
            self.inner.scopes.borrow_mut().forget(owner, node);
        }

        let effect = self.inner.scheduler.borrow_mut().remove(node);
        let producer = self.inner.producers.borrow_mut().remove(&node);
        self.inner.graph.borrow_mut().remove(node);

        if let Some(effect) = effect {
            effect.teardown();
        }
        // Dropped outside of any borrow: user closures may own handles.
        drop(producer);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .field("tracking_depth", &self.inner.tracker.depth())
            .finish()
    }
}

impl PartialEq for Runtime {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Runtime {}
