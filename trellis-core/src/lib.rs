//! Trellis Core
//!
//! This crate provides a single-threaded, fine-grained reactive runtime.
//! It implements:
//!
//! - Reactive primitives (signals, computed values, linked values, effects)
//! - Automatic dependency tracking with glitch-free, lazy propagation
//! - Deterministic effect scheduling with `Root` and `View` classes
//! - Ownership scopes that tear down nodes, effects and subscriptions
//! - A bridge from push streams into read-only signals
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Reactive primitives, the runtime and the effect scheduler
//! - `graph`: Node storage and dirty propagation
//! - `error`: The error type shared by every fallible operation
//! - `config`: Runtime configuration
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use trellis_core::Runtime;
//!
//! let rt = Runtime::new();
//! let root = rt.root();
//!
//! // Create a signal
//! let count = root.signal(0);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = root.computed(move || c.get() * 2);
//!
//! // Create an effect
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let (c, d, l) = (count.clone(), doubled.clone(), log.clone());
//! root.effect(move |_| -> trellis_core::Result<()> {
//!     l.borrow_mut().push(format!("Count: {}, Doubled: {}", c.get(), d.get()?));
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Update the signal, then let the host loop flush effects
//! count.set(5).unwrap();
//! rt.flush().unwrap();
//! assert_eq!(log.borrow().last().unwrap(), "Count: 5, Doubled: 10");
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{ReactiveError, Result};
pub use graph::{DirtyState, NodeId, NodeKind};
pub use reactive::{
    Cleanup, Computed, Effect, EffectClass, EffectOutcome, Emitter, Equality, FlushReport, GraphStats, Linked,
    PushStream, ReadSignal, Runtime, Scope, ScopeId, Signal, Subscription,
};
