//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computed
//! values, linked values and effects, plus the runtime that connects them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (a computed derivation or an effect body), the
//! signal is registered as a dependency of that context. When the value
//! changes, all dependents are marked dirty.
//!
//! ## Computed Values
//!
//! A Computed is a derived value that caches its result. It re-evaluates
//! only when it is read after one of its dependencies actually changed.
//! Derivations must be pure: writing a signal from inside one fails.
//!
//! ## Linked Values
//!
//! A Linked value follows a source computation but accepts local writes,
//! which survive until the source reports a value with a new identity.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation. It runs once when created,
//! then again on [`Runtime::flush`] whenever a dependency changed. Effects
//! in the `Root` class always run before those in the `View` class.
//!
//! ## Scopes
//!
//! Every primitive is created through a [`Scope`] and lives until that
//! scope is disposed.
//!
//! # Implementation Notes
//!
//! Tracking state lives in the [`Runtime`] rather than in a thread-local,
//! so independent runtimes never observe each other's reads. When a node
//! is read, the runtime checks the frame on top of its tracking stack and,
//! if that frame is tracking, records the dependency.

mod computed;
mod context;
mod effect;
mod equality;
mod linked;
mod runtime;
mod scheduler;
mod scope;
mod signal;
mod stream;

pub use computed::Computed;
pub use effect::{Cleanup, Effect, EffectClass, EffectOutcome};
pub use equality::Equality;
pub use linked::Linked;
pub use runtime::{GraphStats, Runtime};
pub use scheduler::FlushReport;
pub use scope::{Scope, ScopeId};
pub use signal::{ReadSignal, Signal};
pub use stream::{Emitter, PushStream, Sink, Subscription};
