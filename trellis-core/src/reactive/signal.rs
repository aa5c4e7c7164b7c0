//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! is the only place where new values enter the graph.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    read is recorded as a dependency of that context.
//!
//! 2. When a signal is written with a value its equality policy considers
//!    different, its version is bumped and every transitive dependent is
//!    marked dirty before `set` returns.
//!
//! 3. Nothing recomputes at write time. Computed values pull on their next
//!    read and effects wait for the next flush.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::equality::Equality;
use super::runtime::Runtime;
use super::scope::ScopeId;
use crate::error::Result;
use crate::graph::{NodeId, NodeKind};

struct SignalInner<T> {
    id: NodeId,
    rt: Runtime,
    value: RefCell<T>,
    equal: Equality<T>,
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```
/// use trellis_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.root().signal(0);
///
/// count.set(5).unwrap();
/// count.update(|v| v + 1).unwrap();
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + 'static,
{
    pub(crate) fn new(rt: &Runtime, owner: ScopeId, value: T, equal: Equality<T>) -> Self {
        let id = rt.create_node(NodeKind::Signal, owner, None);
        Self {
            inner: Rc::new(SignalInner {
                id,
                rt: rt.clone(),
                value: RefCell::new(value),
                equal,
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the signal
    /// as a dependency of the running computation.
    pub fn get(&self) -> T {
        self.inner.rt.track(self.inner.id);
        self.get_untracked()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Set a new value.
    ///
    /// A value equal to the current one (per the equality policy) is
    /// ignored. Otherwise fails if a computed value is deriving or the
    /// signal was disposed; on success every dependent is marked dirty.
    pub fn set(&self, value: T) -> Result<()> {
        let unchanged = self.inner.equal.is_equal(&self.inner.value.borrow(), &value);
        if unchanged {
            return Ok(());
        }

        self.inner.rt.check_write(self.inner.id)?;
        *self.inner.value.borrow_mut() = value;
        self.inner.rt.commit_write(self.inner.id);
        Ok(())
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let current = self.inner.value.borrow();
            f(&current)
        };
        self.set(next)
    }

    /// Current version. `None` once the signal has been disposed.
    pub fn version(&self) -> Option<u64> {
        self.inner.rt.version_of(self.inner.id)
    }

    /// A read-only view of this signal.
    pub fn read_only(&self) -> ReadSignal<T> {
        ReadSignal {
            signal: self.clone(),
        }
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .finish()
    }
}

/// A signal that can only be read, such as one fed by a push stream.
pub struct ReadSignal<T> {
    signal: Signal<T>,
}

impl<T> ReadSignal<T>
where
    T: Clone + 'static,
{
    pub fn id(&self) -> NodeId {
        self.signal.id()
    }

    /// Get the current value, tracking the read.
    pub fn get(&self) -> T {
        self.signal.get()
    }

    pub fn get_untracked(&self) -> T {
        self.signal.get_untracked()
    }

    pub fn version(&self) -> Option<u64> {
        self.signal.version()
    }
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T> Debug for ReadSignal<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadSignal").field(&self.signal).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
