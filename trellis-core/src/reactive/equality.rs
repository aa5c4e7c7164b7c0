//! Equality policies.
//!
//! Every producer decides through its policy whether a new value counts as
//! a change. Equal values are dropped: no version bump, no propagation.

use std::fmt;
use std::rc::Rc;

/// Comparison deciding whether `new` replaces `old` as a change.
pub struct Equality<T: ?Sized> {
    eq: Rc<dyn Fn(&T, &T) -> bool>,
}

impl<T: ?Sized + 'static> Equality<T> {
    /// Build a policy from a comparison function.
    pub fn new<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + 'static,
    {
        Self { eq: Rc::new(eq) }
    }

    /// Treat every write as a change.
    pub fn never() -> Self {
        Self::new(|_, _| false)
    }

    /// Compare through a projection, e.g. an id field.
    pub fn by_key<K, F>(key: F) -> Self
    where
        K: PartialEq,
        F: Fn(&T) -> K + 'static,
    {
        Self::new(move |a, b| key(a) == key(b))
    }

    pub fn is_equal(&self, old: &T, new: &T) -> bool {
        (self.eq)(old, new)
    }
}

impl<T: PartialEq + ?Sized + 'static> Equality<T> {
    /// Value equality through `PartialEq`.
    pub fn partial_eq() -> Self {
        Self::new(|a: &T, b: &T| a == b)
    }
}

impl<T: PartialEq + ?Sized + 'static> Default for Equality<T> {
    fn default() -> Self {
        Self::partial_eq()
    }
}

impl<T: ?Sized> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: Rc::clone(&self.eq),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equality(..)")
    }
}
