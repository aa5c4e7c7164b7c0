//! Ownership scopes.
//!
//! Every node belongs to exactly one scope. Scopes form a tree rooted at the
//! runtime's root scope; disposing a scope disposes its descendants, the
//! nodes it owns and runs its cleanup callbacks. The tree order also drives
//! `View` effect scheduling: a parent scope's effects run before those of
//! its descendants.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::computed::Computed;
use super::effect::{Cleanup, Effect, EffectClass, EffectOutcome};
use super::equality::Equality;
use super::linked::Linked;
use super::runtime::Runtime;
use super::signal::{ReadSignal, Signal};
use super::stream::PushStream;
use crate::error::Result;
use crate::graph::NodeId;

/// Identifier of a scope within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(u64);

impl ScopeId {
    /// The runtime's root scope.
    pub const ROOT: ScopeId = ScopeId(0);
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

type CleanupFn = Box<dyn FnOnce()>;

/// A scope removed from the tree, ready to be torn down.
pub(crate) struct DetachedScope {
    pub children: IndexSet<ScopeId>,
    pub nodes: SmallVec<[NodeId; 8]>,
    pub cleanups: Vec<CleanupFn>,
}

struct ScopeEntry {
    parent: Option<ScopeId>,
    children: IndexSet<ScopeId>,
    /// Owned nodes in creation order.
    nodes: SmallVec<[NodeId; 8]>,
    cleanups: Vec<CleanupFn>,
}

impl ScopeEntry {
    fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            children: IndexSet::new(),
            nodes: SmallVec::new(),
            cleanups: Vec::new(),
        }
    }
}

/// Pre-order position of a scope, see [`ScopeTree::position`].
pub(crate) type ScopePosition = SmallVec<[usize; 8]>;

/// The scope tree of one runtime.
pub(crate) struct ScopeTree {
    entries: HashMap<ScopeId, ScopeEntry>,
    next: u64,
}

impl ScopeTree {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(ScopeId::ROOT, ScopeEntry::new(None));
        Self { entries, next: 1 }
    }

    /// Allocate a scope under `parent`. The id is allocated even when the
    /// parent is gone, in which case the new scope starts out disposed.
    pub fn create(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.next);
        self.next += 1;

        if let Some(parent_entry) = self.entries.get_mut(&parent) {
            parent_entry.children.insert(id);
            self.entries.insert(id, ScopeEntry::new(Some(parent)));
        }
        id
    }

    pub fn contains(&self, scope: ScopeId) -> bool {
        self.entries.contains_key(&scope)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record `node` as owned by `scope`. Returns `false` if the scope is gone.
    pub fn adopt(&mut self, scope: ScopeId, node: NodeId) -> bool {
        match self.entries.get_mut(&scope) {
            Some(entry) => {
                entry.nodes.push(node);
                true
            }
            None => false,
        }
    }

    /// Drop `node` from its scope without disposing the scope.
    pub fn forget(&mut self, scope: ScopeId, node: NodeId) {
        if let Some(entry) = self.entries.get_mut(&scope) {
            entry.nodes.retain(|owned| *owned != node);
        }
    }

    /// Queue a cleanup callback. Hands it back if the scope is gone.
    pub fn on_cleanup(&mut self, scope: ScopeId, cleanup: CleanupFn) -> std::result::Result<(), CleanupFn> {
        match self.entries.get_mut(&scope) {
            Some(entry) => {
                entry.cleanups.push(cleanup);
                Ok(())
            }
            None => Err(cleanup),
        }
    }

    /// Remove `scope` from the tree and return what it owned. Descendants
    /// stay in the tree until they are detached themselves.
    pub fn detach(&mut self, scope: ScopeId) -> Option<DetachedScope> {
        let entry = self.entries.remove(&scope)?;
        if let Some(parent) = entry.parent.and_then(|p| self.entries.get_mut(&p)) {
            parent.children.shift_remove(&scope);
        }
        Some(DetachedScope {
            children: entry.children,
            nodes: entry.nodes,
            cleanups: entry.cleanups,
        })
    }

    /// Where `scope` sits in the tree: the child index taken at each level
    /// below the root. Positions compare in pre-order, each scope before
    /// its descendants and siblings in creation order. `None` once the
    /// scope is gone.
    pub fn position(&self, scope: ScopeId) -> Option<ScopePosition> {
        let mut path = ScopePosition::new();
        let mut current = scope;
        loop {
            let entry = self.entries.get(&current)?;
            let Some(parent) = entry.parent else {
                break;
            };
            path.push(self.entries.get(&parent)?.children.get_index_of(&current)?);
            current = parent;
        }
        path.reverse();
        Some(path)
    }
}

/// A handle to a scope, used to create reactive primitives owned by it.
///
/// ```
/// use trellis_core::Runtime;
///
/// let rt = Runtime::new();
/// let root = rt.root();
/// let count = root.signal(1);
/// let c = count.clone();
/// let doubled = root.computed(move || c.get() * 2);
///
/// count.set(5).unwrap();
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
#[derive(Clone)]
pub struct Scope {
    id: ScopeId,
    rt: Runtime,
}

impl Scope {
    pub(crate) fn new(rt: Runtime, id: ScopeId) -> Self {
        Self { id, rt }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn is_root(&self) -> bool {
        self.id == ScopeId::ROOT
    }

    pub fn is_disposed(&self) -> bool {
        !self.rt.scopes().contains(self.id)
    }

    /// Create a nested scope. Its effects run in the `View` class by default.
    pub fn child(&self) -> Scope {
        Scope::new(self.rt.clone(), self.rt.create_scope(self.id))
    }

    /// Create a signal compared with `PartialEq`.
    pub fn signal<T>(&self, value: T) -> Signal<T>
    where
        T: Clone + PartialEq + 'static,
    {
        self.signal_with(value, Equality::default())
    }

    /// Create a signal with a custom equality policy.
    pub fn signal_with<T>(&self, value: T, equal: Equality<T>) -> Signal<T>
    where
        T: Clone + 'static,
    {
        Signal::new(&self.rt, self.id, value, equal)
    }

    /// Create a computed value from an infallible derivation.
    pub fn computed<T, F>(&self, derive: F) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        self.computed_with(Equality::default(), move || Ok(derive()))
    }

    /// Create a computed value from a derivation that may fail.
    pub fn try_computed<T, F>(&self, derive: F) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> Result<T> + 'static,
    {
        self.computed_with(Equality::default(), derive)
    }

    /// Create a computed value with a custom equality policy.
    pub fn computed_with<T, F>(&self, equal: Equality<T>, derive: F) -> Computed<T>
    where
        T: Clone + 'static,
        F: Fn() -> Result<T> + 'static,
    {
        Computed::new(&self.rt, self.id, Box::new(derive), equal)
    }

    /// Create an effect in this scope's default class: `Root` for the root
    /// scope, `View` for every other scope.
    ///
    /// The effect runs once right away to discover its dependencies. Fails
    /// when called from a computed derivation or an effect body.
    pub fn effect<F, R>(&self, run: F) -> Result<Effect>
    where
        F: FnMut(&mut Cleanup) -> R + 'static,
        R: EffectOutcome,
    {
        let class = if self.is_root() {
            EffectClass::Root
        } else {
            EffectClass::View
        };
        self.effect_with_class(class, run)
    }

    /// Create an effect with an explicit scheduling class.
    pub fn effect_with_class<F, R>(&self, class: EffectClass, mut run: F) -> Result<Effect>
    where
        F: FnMut(&mut Cleanup) -> R + 'static,
        R: EffectOutcome,
    {
        Effect::new(
            &self.rt,
            self.id,
            class,
            Box::new(move |cleanup: &mut Cleanup| run(cleanup).into_result()),
        )
    }

    /// Bridge a push stream into a read-only signal holding `initial` until
    /// the first emission.
    ///
    /// Fails before subscribing when called from a computed derivation or an
    /// effect body. The subscription ends when this scope is disposed.
    pub fn from_stream<S, T>(&self, stream: &S, initial: T) -> Result<ReadSignal<T>>
    where
        S: PushStream<T> + ?Sized,
        T: Clone + PartialEq + 'static,
    {
        self.rt.assert_not_in_reactive_context("stream bridge creation")?;

        let signal = self.signal(initial);
        let sink = signal.clone();
        let subscription = stream.subscribe(Box::new(move |value: T| {
            if let Err(err) = sink.set(value) {
                tracing::warn!(signal = %sink.id(), error = %err, "dropped stream emission");
            }
        }));
        self.on_cleanup(move || subscription.unsubscribe());

        Ok(signal.read_only())
    }

    /// Create a writable value that follows `source` and keeps local writes
    /// until the source reports a different identity under `key_equal`.
    pub fn linked<T, F, K>(&self, source: F, key_equal: K) -> Linked<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
        K: Fn(&T, &T) -> bool + 'static,
    {
        self.try_linked(move || Ok(source()), key_equal)
    }

    /// Like [`Scope::linked`] with a source that may fail.
    pub fn try_linked<T, F, K>(&self, source: F, key_equal: K) -> Linked<T>
    where
        T: Clone + 'static,
        F: Fn() -> Result<T> + 'static,
        K: Fn(&T, &T) -> bool + 'static,
    {
        Linked::new(&self.rt, self.id, Box::new(source), Box::new(key_equal))
    }

    /// Run `cleanup` when this scope is disposed (immediately if it already is).
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        self.rt.on_scope_cleanup(self.id, Box::new(cleanup));
    }

    /// Dispose this scope, its descendants and everything they own.
    pub fn dispose(&self) {
        self.rt.dispose_scope(self.id);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
