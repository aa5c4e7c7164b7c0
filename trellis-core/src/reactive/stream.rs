//! Push Streams
//!
//! External event sources enter the graph through [`Scope::from_stream`],
//! which turns a push stream into a read-only signal. Anything that can
//! hand values to a callback can implement [`PushStream`]; [`Emitter`] is a
//! simple in-process implementation.
//!
//! [`Scope::from_stream`]: super::Scope::from_stream

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;

/// Callback receiving stream values.
pub type Sink<T> = Box<dyn FnMut(T)>;

/// A source that pushes values to subscribers.
pub trait PushStream<T> {
    /// Start delivering values to `sink` until the returned subscription is
    /// cancelled.
    fn subscribe(&self, sink: Sink<T>) -> Subscription;
}

/// Handle to an active subscription.
///
/// Cancelling consumes the handle, so a subscription is cancelled at most
/// once. Dropping it without calling [`Subscription::unsubscribe`] leaves
/// the stream delivering values.
#[must_use = "dropping a subscription does not cancel it"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type SharedSink<T> = Rc<RefCell<Sink<T>>>;
type Sinks<T> = Rc<RefCell<Slab<SharedSink<T>>>>;

/// A push stream that delivers each emitted value to every subscriber.
///
/// ```
/// use trellis_core::{Emitter, Runtime};
///
/// let rt = Runtime::new();
/// let ticks = Emitter::<i32>::new();
/// let latest = rt.root().from_stream(&ticks, 0).unwrap();
///
/// ticks.emit(3);
/// assert_eq!(latest.get(), 3);
/// ```
pub struct Emitter<T> {
    sinks: Sinks<T>,
}

impl<T> Emitter<T>
where
    T: Clone + 'static,
{
    pub fn new() -> Self {
        Self {
            sinks: Rc::new(RefCell::new(Slab::new())),
        }
    }

    /// Deliver `value` to every current subscriber, in subscription order.
    ///
    /// Subscribers added or removed by a sink take effect from the next
    /// emission.
    pub fn emit(&self, value: T) {
        let sinks: Vec<SharedSink<T>> = self.sinks.borrow().iter().map(|(_, sink)| sink.clone()).collect();
        for sink in sinks {
            match sink.try_borrow_mut() {
                Ok(mut sink) => (&mut **sink)(value.clone()),
                Err(_) => tracing::warn!("re-entrant emission skipped for a busy subscriber"),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.borrow().len()
    }
}

impl<T> Default for Emitter<T>
where
    T: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PushStream<T> for Emitter<T>
where
    T: Clone + 'static,
{
    fn subscribe(&self, sink: Sink<T>) -> Subscription {
        let key = self.sinks.borrow_mut().insert(Rc::new(RefCell::new(sink)));
        let sinks: Weak<RefCell<Slab<SharedSink<T>>>> = Rc::downgrade(&self.sinks);
        Subscription::new(move || {
            if let Some(sinks) = sinks.upgrade() {
                sinks.borrow_mut().try_remove(key);
            }
        })
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("subscribers", &self.sinks.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
