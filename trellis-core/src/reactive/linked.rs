//! Linked Implementation
//!
//! A Linked value follows a source computation but can also be written
//! locally. A local write wins until the source reports a value with a
//! different identity, at which point the override is discarded.
//!
//! # How Linked Values Work
//!
//! 1. The source function is tracked like a computed derivation and only
//!    re-runs when one of its producers changed.
//!
//! 2. On every recompute the new source value is compared with the previous
//!    one using the key-equality function. Same identity keeps the local
//!    override; a new identity (or no previous value) drops it.
//!
//! 3. A write first brings the source up to date, so the override binds to
//!    the identity that is current at write time.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::context::FrameKind;
use super::runtime::{Reactive, Runtime};
use super::scope::ScopeId;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, NodeId, NodeKind};

type SourceFn<T> = Box<dyn Fn() -> Result<T>>;
type KeyEqualFn<T> = Box<dyn Fn(&T, &T) -> bool>;

struct LinkedState<T> {
    /// Source value seen by the last successful recompute.
    last_source: Option<T>,
    /// Local write, if one is in effect.
    local: Option<T>,
}

struct LinkedInner<T> {
    id: NodeId,
    rt: Runtime,
    source: SourceFn<T>,
    key_equal: KeyEqualFn<T>,
    state: RefCell<LinkedState<T>>,
    refreshing: Cell<bool>,
}

impl<T> LinkedInner<T>
where
    T: Clone + 'static,
{
    fn has_value(&self) -> bool {
        self.state.borrow().last_source.is_some()
    }

    fn cached(&self) -> Result<T> {
        let state = self.state.borrow();
        state
            .local
            .as_ref()
            .or(state.last_source.as_ref())
            .cloned()
            .ok_or(ReactiveError::Disposed(self.id))
    }

    fn refresh_inner(&self) -> Result<()> {
        let dirty = self
            .rt
            .dirty_state_of(self.id)
            .ok_or(ReactiveError::Disposed(self.id))?;

        match dirty {
            DirtyState::Clean if self.has_value() => Ok(()),
            DirtyState::MaybeDirty if self.has_value() && !self.rt.producers_changed(self.id) => {
                self.rt.mark_clean(self.id);
                Ok(())
            }
            _ => self.recompute(),
        }
    }

    fn recompute(&self) -> Result<()> {
        let guard = self.rt.enter(self.id, FrameKind::Derivation);
        let outcome = (self.source)();
        let frame = guard.finish();

        if let Some(signal) = frame.write_violation {
            self.rt.finish_run(self.id, frame.observed, false);
            return Err(ReactiveError::WriteDuringComputation {
                signal,
                computation: self.id,
            });
        }
        let current = match outcome {
            Ok(value) => value,
            Err(err) => {
                self.rt.finish_run(self.id, frame.observed, false);
                return Err(err);
            }
        };
        self.rt.finish_run(self.id, frame.observed, true);

        let same_identity = {
            let state = self.state.borrow();
            state.local.is_some()
                && state
                    .last_source
                    .as_ref()
                    .is_some_and(|last| (self.key_equal)(last, &current))
        };

        {
            let mut state = self.state.borrow_mut();
            if !same_identity && state.local.take().is_some() {
                tracing::trace!(node = %self.id, "source identity changed, dropped local value");
            }
            state.last_source = Some(current);
        }

        self.rt.bump_version(self.id);
        self.rt.mark_clean(self.id);
        Ok(())
    }
}

impl<T> Reactive for LinkedInner<T>
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

/// A writable value kept in sync with a source computation.
///
/// # Example
///
/// ```
/// use trellis_core::Runtime;
///
/// let rt = Runtime::new();
/// let root = rt.root();
/// let selected = root.signal((1, "first"));
///
/// let s = selected.clone();
/// let draft = root.linked(move || s.get(), |a, b| a.0 == b.0);
///
/// draft.set((1, "edited")).unwrap();
/// selected.set((1, "renamed")).unwrap();
/// assert_eq!(draft.get().unwrap(), (1, "edited"));
///
/// selected.set((2, "second")).unwrap();
/// assert_eq!(draft.get().unwrap(), (2, "second"));
/// ```
pub struct Linked<T> {
    inner: Rc<LinkedInner<T>>,
}

impl<T> Linked<T>
where
    T: Clone + 'static,
{
    /// The source is not run until the first read or write.
    pub(crate) fn new(rt: &Runtime, owner: ScopeId, source: SourceFn<T>, key_equal: KeyEqualFn<T>) -> Self {
        let id = rt.create_node(NodeKind::Linked, owner, None);
        let inner = Rc::new(LinkedInner {
            id,
            rt: rt.clone(),
            source,
            key_equal,
            state: RefCell::new(LinkedState {
                last_source: None,
                local: None,
            }),
            refreshing: Cell::new(false),
        });
        rt.register_producer(inner.clone());
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the effective value: the local override if one is in effect,
    /// otherwise the latest source value.
    pub fn get(&self) -> Result<T> {
        let refreshed = self.inner.refresh();
        self.inner.rt.track(self.inner.id);

        match refreshed {
            Ok(()) => self.inner.cached(),
            Err(ReactiveError::Disposed(id)) if id == self.inner.id => self.inner.cached(),
            Err(err) => Err(err),
        }
    }

    pub fn get_untracked(&self) -> Result<T> {
        self.inner.rt.untracked(|| self.get())
    }

    /// Override the value locally.
    ///
    /// The override lasts until the source produces a value with a
    /// different identity. Every write bumps the version and marks
    /// dependents dirty, even when the value is unchanged.
    ///
    /// A failing source does not block the write. The override then binds
    /// to the last source value that succeeded, if any, and the source
    /// error surfaces again on the next read.
    pub fn set(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        inner.rt.check_write(inner.id)?;
        if let Err(err) = inner.refresh() {
            tracing::debug!(node = %inner.id, error = %err, "source failed before local write");
        }

        inner.state.borrow_mut().local = Some(value);
        inner.rt.commit_write(inner.id);
        Ok(())
    }

    /// Override the value with a function of the effective value.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.get_untracked()?;
        self.set(f(&current))
    }

    /// Whether a local write is currently overriding the source.
    pub fn is_overridden(&self) -> bool {
        self.inner.state.borrow().local.is_some()
    }

    pub fn state(&self) -> Option<DirtyState> {
        self.inner.rt.dirty_state_of(self.inner.id)
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.rt.version_of(self.inner.id)
    }
}

impl<T> Clone for Linked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Linked<T>
where
    T: Clone + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linked")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("overridden", &self.is_overridden())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
