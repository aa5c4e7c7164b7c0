//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computed Values Work
//!
//! 1. On first access, the derivation runs and the result is cached.
//!
//! 2. When accessed again, if no dependencies have changed, the cached value
//!    is returned without running the derivation.
//!
//! 3. When a direct dependency changes, the node is marked "dirty"; when
//!    only a transitive one changes, it is marked "maybe dirty".
//!
//! 4. On next access, a maybe-dirty node first checks whether any direct
//!    producer's version actually moved. If none did, it becomes clean
//!    without recomputing.
//!
//! # Why This Matters
//!
//! - A signal changes
//! - 10 computed values depend on it
//! - Only the ones actually read will recompute
//! - The others stay dirty (no wasted work)
//!
//! # Purity
//!
//! A derivation must not write signals. Such a write fails, and the
//! derivation it happened in fails too, even if the write's error was
//! ignored.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::context::FrameKind;
use super::equality::Equality;
use super::runtime::{Reactive, Runtime};
use super::scope::ScopeId;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, NodeId, NodeKind};

type DeriveFn<T> = Box<dyn Fn() -> Result<T>>;

struct ComputedInner<T> {
    id: NodeId,
    rt: Runtime,
    derive: DeriveFn<T>,
    /// The cached value (`None` until the first successful derivation).
    value: RefCell<Option<T>>,
    equal: Equality<T>,
    /// Set while this node is refreshing, to catch cycles.
    refreshing: Cell<bool>,
}

impl<T> ComputedInner<T>
where
    T: Clone + 'static,
{
    fn has_value(&self) -> bool {
        self.value.borrow().is_some()
    }

    fn cached(&self) -> Result<T> {
        self.value
            .borrow()
            .clone()
            .ok_or(ReactiveError::Disposed(self.id))
    }

    /// Bring the cached value up to date.
    fn refresh_inner(&self) -> Result<()> {
        let state = self
            .rt
            .dirty_state_of(self.id)
            .ok_or(ReactiveError::Disposed(self.id))?;

        match state {
            DirtyState::Clean if self.has_value() => Ok(()),
            DirtyState::MaybeDirty if self.has_value() && !self.rt.producers_changed(self.id) => {
                self.rt.mark_clean(self.id);
                Ok(())
            }
            _ => self.recompute(),
        }
    }

    /// Run the derivation within a tracking frame.
    fn recompute(&self) -> Result<()> {
        let guard = self.rt.enter(self.id, FrameKind::Derivation);
        let outcome = (self.derive)();
        let frame = guard.finish();

        if let Some(signal) = frame.write_violation {
            self.rt.finish_run(self.id, frame.observed, false);
            return Err(ReactiveError::WriteDuringComputation {
                signal,
                computation: self.id,
            });
        }

        let new_value = match outcome {
            Ok(value) => value,
            Err(err) => {
                self.rt.finish_run(self.id, frame.observed, false);
                tracing::trace!(node = %self.id, error = %err, "derivation failed");
                return Err(err);
            }
        };
        self.rt.finish_run(self.id, frame.observed, true);

        let changed = match &*self.value.borrow() {
            Some(current) => !self.equal.is_equal(current, &new_value),
            None => true,
        };
        if changed {
            *self.value.borrow_mut() = Some(new_value);
            self.rt.bump_version(self.id);
        }
        self.rt.mark_clean(self.id);
        Ok(())
    }
}

impl<T> Reactive for ComputedInner<T>
where
    T: Clone + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn refresh(&self) -> Result<()> {
        if self.refreshing.replace(true) {
            return Err(ReactiveError::Cycle(self.id));
        }
        let result = self.refresh_inner();
        self.refreshing.set(false);
        result
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// The derivation must be pure: reads are tracked, writes fail.
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + 'static,
{
    /// The derivation is not run immediately. It runs on first access.
    pub(crate) fn new(rt: &Runtime, owner: ScopeId, derive: DeriveFn<T>, equal: Equality<T>) -> Self {
        let id = rt.create_node(NodeKind::Computed, owner, None);
        let inner = Rc::new(ComputedInner {
            id,
            rt: rt.clone(),
            derive,
            value: RefCell::new(None),
            equal,
            refreshing: Cell::new(false),
        });
        rt.register_producer(inner.clone());
        Self { inner }
    }

    /// Get the computed's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// Errors from the derivation are returned as-is; the node stays dirty
    /// and the next read retries. A disposed node returns its last value,
    /// or [`ReactiveError::Disposed`] if it never computed one.
    pub fn get(&self) -> Result<T> {
        let refreshed = self.inner.refresh();
        self.inner.rt.track(self.inner.id);

        match refreshed {
            Ok(()) => self.inner.cached(),
            Err(ReactiveError::Disposed(id)) if id == self.inner.id => self.inner.cached(),
            Err(err) => Err(err),
        }
    }

    /// Get the current value without registering a dependency.
    pub fn get_untracked(&self) -> Result<T> {
        self.inner.rt.untracked(|| self.get())
    }

    /// Current dirty state, `None` once disposed.
    pub fn state(&self) -> Option<DirtyState> {
        self.inner.rt.dirty_state_of(self.inner.id)
    }

    /// Current version, `None` once disposed.
    pub fn version(&self) -> Option<u64> {
        self.inner.rt.version_of(self.inner.id)
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.has_value()
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
