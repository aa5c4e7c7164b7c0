//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs after its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued. It re-runs on the
//!    next [`Runtime::flush`](super::Runtime::flush), never inside the write
//!    that dirtied it.
//!
//! 3. Each run replaces the dependencies recorded by the previous one.
//!
//! # Cleanup
//!
//! The effect body receives a [`Cleanup`] registrar. Callbacks registered
//! there run before the next run and when the effect is disposed. This is
//! useful for releasing resources like listeners or timers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::context::FrameKind;
use super::runtime::Runtime;
use super::scope::ScopeId;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, NodeKind};

/// Scheduling class of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectClass {
    /// Application-wide effects. All pending root effects run before any
    /// view effect.
    Root,

    /// Effects owned by a narrower scope. They run after root effects,
    /// parent scopes before their descendants.
    View,
}

/// Values an effect body may return.
pub trait EffectOutcome {
    fn into_result(self) -> Result<()>;
}

impl EffectOutcome for () {
    fn into_result(self) -> Result<()> {
        Ok(())
    }
}

impl EffectOutcome for Result<()> {
    fn into_result(self) -> Result<()> {
        self
    }
}

type CleanupFn = Box<dyn FnOnce()>;

/// Registrar passed to an effect body.
#[derive(Default)]
pub struct Cleanup {
    callbacks: Vec<CleanupFn>,
}

impl Cleanup {
    /// Run `f` before the effect's next run, or when it is disposed.
    ///
    /// Callbacks registered in one run execute in reverse order.
    pub fn on_cleanup(&mut self, f: impl FnOnce() + 'static) {
        self.callbacks.push(Box::new(f));
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

pub(crate) type EffectFn = Box<dyn FnMut(&mut Cleanup) -> Result<()>>;

/// Registry-owned state of one effect.
pub(crate) struct EffectSlot {
    id: NodeId,
    class: EffectClass,
    body: RefCell<EffectFn>,
    cleanups: RefCell<Vec<CleanupFn>>,
    runs: Cell<usize>,
    disposed: Cell<bool>,
}

impl EffectSlot {
    fn new(id: NodeId, class: EffectClass, body: EffectFn) -> Self {
        Self {
            id,
            class,
            body: RefCell::new(body),
            cleanups: RefCell::new(Vec::new()),
            runs: Cell::new(0),
            disposed: Cell::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn class(&self) -> EffectClass {
        self.class
    }

    fn run_cleanups(&self) {
        let callbacks = std::mem::take(&mut *self.cleanups.borrow_mut());
        for callback in callbacks.into_iter().rev() {
            callback();
        }
    }

    /// Execute the effect function.
    ///
    /// This runs the previous cleanup, then the body within a tracking frame.
    pub fn run(&self, rt: &Runtime) -> Result<()> {
        if self.disposed.get() {
            return Ok(());
        }
        self.run_cleanups();

        let guard = rt.enter(self.id, FrameKind::Effect);
        let mut registrar = Cleanup::default();
        let outcome = match self.body.try_borrow_mut() {
            Ok(mut body) => (&mut **body)(&mut registrar),
            Err(_) => Err(ReactiveError::Cycle(self.id)),
        };
        let frame = guard.finish();

        rt.finish_run(self.id, frame.observed, outcome.is_ok());
        rt.mark_clean(self.id);
        self.runs.set(self.runs.get() + 1);

        if self.disposed.get() {
            // Disposed from inside its own body: nothing will run these later.
            for callback in registrar.callbacks.into_iter().rev() {
                callback();
            }
        } else {
            *self.cleanups.borrow_mut() = registrar.callbacks;
        }

        outcome.map_err(|err| ReactiveError::EffectRun {
            effect: self.id,
            source: Box::new(err),
        })
    }

    /// Mark the effect disposed and run its last cleanup.
    pub fn teardown(&self) {
        if !self.disposed.replace(true) {
            self.run_cleanups();
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

/// A side-effecting computation that re-runs when dependencies change.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use trellis_core::Runtime;
///
/// let rt = Runtime::new();
/// let root = rt.root();
/// let count = root.signal(0);
/// let seen = Rc::new(Cell::new(-1));
///
/// let (c, s) = (count.clone(), seen.clone());
/// let _effect = root.effect(move |_| s.set(c.get())).unwrap();
/// assert_eq!(seen.get(), 0);
///
/// count.set(5).unwrap();
/// assert_eq!(seen.get(), 0); // deferred until the flush
/// rt.flush().unwrap();
/// assert_eq!(seen.get(), 5);
/// ```
#[derive(Clone)]
pub struct Effect {
    slot: Rc<EffectSlot>,
    rt: Runtime,
}

impl Effect {
    /// Create the effect and run it once.
    ///
    /// If the first run fails, the effect is disposed again and the error
    /// returned.
    pub(crate) fn new(rt: &Runtime, owner: ScopeId, class: EffectClass, body: EffectFn) -> Result<Self> {
        rt.assert_not_in_reactive_context("effect creation")?;

        let id = rt.create_node(NodeKind::Effect, owner, Some(class));
        if !rt.contains(id) {
            return Err(ReactiveError::Disposed(id));
        }

        let slot = Rc::new(EffectSlot::new(id, class, body));
        rt.register_effect(slot.clone());

        if let Err(err) = slot.run(rt) {
            rt.dispose_node(id);
            return Err(err);
        }

        Ok(Self {
            slot,
            rt: rt.clone(),
        })
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.slot.id()
    }

    pub fn class(&self) -> EffectClass {
        self.slot.class()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.slot.run_count()
    }

    /// Producers read during the last run.
    pub fn dependency_ids(&self) -> Vec<NodeId> {
        self.rt.dependencies_of(self.id())
    }

    /// Dispose of the effect before its scope ends.
    ///
    /// Runs the last cleanup. After disposal, the effect will not run again.
    pub fn dispose(&self) {
        self.rt.dispose_node(self.id());
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.slot.is_disposed()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("class", &self.class())
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn effect_runs_on_creation() {
        let rt = Runtime::new();
        let runs = counter();
        let r = runs.clone();

        let effect = rt.root().effect(move |_| r.set(r.get() + 1)).unwrap();

        assert_eq!(runs.get(), 1);
        assert_eq!(effect.run_count(), 1);
        assert_eq!(effect.class(), EffectClass::Root);
    }

    #[test]
    fn effect_reruns_only_on_flush() {
        let rt = Runtime::new();
        let root = rt.root();
        let signal = root.signal(0);
        let runs = counter();

        let (s, r) = (signal.clone(), runs.clone());
        let effect = root
            .effect(move |_| {
                s.get();
                r.set(r.get() + 1);
            })
            .unwrap();

        signal.set(1).unwrap();
        signal.set(2).unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(rt.pending_effects(), 1);

        rt.flush().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(effect.run_count(), 2);

        // Nothing pending: flush is a no-op
        rt.flush().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn cleanup_runs_before_next_run_and_on_dispose() {
        let rt = Runtime::new();
        let root = rt.root();
        let signal = root.signal(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        let (s, l) = (signal.clone(), log.clone());
        let effect = root
            .effect(move |cleanup| {
                let value = s.get();
                l.borrow_mut().push(format!("run {value}"));
                let l = l.clone();
                cleanup.on_cleanup(move || l.borrow_mut().push(format!("cleanup {value}")));
            })
            .unwrap();

        signal.set(1).unwrap();
        rt.flush().unwrap();
        effect.dispose();

        assert_eq!(
            *log.borrow(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
        assert!(effect.is_disposed());
    }

    #[test]
    fn disposed_effect_does_not_run() {
        let rt = Runtime::new();
        let root = rt.root();
        let signal = root.signal(0);
        let runs = counter();

        let (s, r) = (signal.clone(), runs.clone());
        let effect = root
            .effect(move |_| {
                s.get();
                r.set(r.get() + 1);
            })
            .unwrap();

        effect.dispose();
        signal.set(1).unwrap();
        rt.flush().unwrap();

        assert_eq!(runs.get(), 1);
        assert!(!rt.contains(effect.id()));
        assert!(rt.dependents_of(signal.id()).is_empty());
    }

    #[test]
    fn effect_creation_inside_effect_is_rejected() {
        let rt = Runtime::new();
        let root = rt.root();
        let inner_result = Rc::new(RefCell::new(None));

        let (scope, slot) = (root.clone(), inner_result.clone());
        root.effect(move |_| {
            *slot.borrow_mut() = Some(scope.effect(|_| {}).map(|_| ()));
        })
        .unwrap();

        let result = inner_result.borrow_mut().take().unwrap();
        assert!(matches!(
            result,
            Err(ReactiveError::ContextViolation { operation: "effect creation" })
        ));
    }

    #[test]
    fn failing_first_run_disposes_effect() {
        let rt = Runtime::new();
        let root = rt.root();
        let signal = root.signal(0);

        let s = signal.clone();
        let err = root
            .effect(move |_| -> Result<()> {
                s.get();
                Err(ReactiveError::derivation("not ready"))
            })
            .unwrap_err();

        assert!(err.effect().is_some());
        assert!(err.is_user_error());
        assert!(rt.dependents_of(signal.id()).is_empty());
        assert_eq!(rt.stats().nodes, 1);
    }

    #[test]
    fn child_scope_effects_default_to_view() {
        let rt = Runtime::new();
        let child = rt.root().child();
        let effect = child.effect(|_| {}).unwrap();
        assert_eq!(effect.class(), EffectClass::View);

        let explicit = child.effect_with_class(EffectClass::Root, |_| {}).unwrap();
        assert_eq!(explicit.class(), EffectClass::Root);
    }

    #[test]
    fn self_disposal_runs_new_cleanup_immediately() {
        let rt = Runtime::new();
        let scope = rt.root().child();
        let cleaned = Rc::new(Cell::new(false));

        let (sc, c) = (scope.clone(), cleaned.clone());
        let effect = scope
            .effect(move |cleanup| {
                let c = c.clone();
                cleanup.on_cleanup(move || c.set(true));
                sc.dispose();
            })
            .unwrap();

        assert!(effect.is_disposed());
        assert!(cleaned.get());
        assert!(!rt.contains(effect.id()));
    }
}
