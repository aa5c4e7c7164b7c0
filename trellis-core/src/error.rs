//! Error types for the reactive runtime.

use std::error::Error as StdError;
use std::sync::Arc;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors surfaced by reads, writes, effect runs and flushes.
///
/// Every error is returned to the call that triggered it. Nothing is retried
/// or swallowed by the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A guarded operation was attempted while a tracking frame was active.
    ///
    /// The caller has to move the operation outside of any computed
    /// derivation or effect body (or into `Runtime::untracked`).
    #[error("{operation} is not allowed inside a reactive context")]
    ContextViolation {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// A signal was written while a computed value was deriving.
    ///
    /// The derivation is aborted; its cache and dirty state are unchanged so
    /// the next read retries.
    #[error("signal {signal} was written while {computation} was deriving its value")]
    WriteDuringComputation {
        /// The signal that was written.
        signal: NodeId,
        /// The computed value whose derivation was running.
        computation: NodeId,
    },

    /// A user-supplied derive or effect function reported an error.
    #[error("derivation failed: {source}")]
    Derivation {
        /// The error returned by user code.
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// An effect run failed.
    #[error("effect {effect} failed: {source}")]
    EffectRun {
        /// The effect that failed.
        effect: NodeId,
        /// Why it failed.
        #[source]
        source: Box<ReactiveError>,
    },

    /// One or more effects failed during a flush. The other effects of the
    /// flush still ran. If the flush also hit its pass limit, the
    /// `FlushLimitExceeded` error comes last.
    #[error("{} effect(s) failed during flush", .0.len())]
    Flush(Vec<ReactiveError>),

    /// Effects kept dirtying each other and the flush gave up.
    #[error("flush did not settle after {passes} passes")]
    FlushLimitExceeded {
        /// Number of passes that ran.
        passes: usize,
    },

    /// A computed or linked value read itself while deriving.
    #[error("dependency cycle detected at {0}")]
    Cycle(NodeId),

    /// The node was disposed together with its owning scope.
    #[error("{0} has been disposed")]
    Disposed(NodeId),
}

impl ReactiveError {
    /// Wrap an error returned by user code.
    ///
    /// ```
    /// use trellis_core::ReactiveError;
    ///
    /// let err = ReactiveError::derivation("division by zero");
    /// assert_eq!(err.to_string(), "derivation failed: division by zero");
    /// ```
    pub fn derivation<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        ReactiveError::Derivation {
            source: Arc::from(boxed),
        }
    }

    /// Errors collected by a failed flush, or this error alone.
    pub fn failures(&self) -> &[ReactiveError] {
        match self {
            ReactiveError::Flush(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// The effect that failed, for `EffectRun` errors.
    pub fn effect(&self) -> Option<NodeId> {
        match self {
            ReactiveError::EffectRun { effect, .. } => Some(*effect),
            _ => None,
        }
    }

    /// Returns `true` for errors raised by user code rather than by the
    /// runtime's own guards.
    pub fn is_user_error(&self) -> bool {
        match self {
            ReactiveError::Derivation { .. } => true,
            ReactiveError::EffectRun { source, .. } => source.is_user_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = ReactiveError::derivation(io);

        assert!(err.is_user_error());
        let source = StdError::source(&err).expect("source");
        assert_eq!(source.to_string(), "disk gone");
    }

    #[test]
    fn flush_error_lists_failures() {
        let id = NodeId::new(0, 3);
        let failure = ReactiveError::EffectRun {
            effect: id,
            source: Box::new(ReactiveError::derivation("boom")),
        };
        let err = ReactiveError::Flush(vec![failure.clone()]);

        assert_eq!(err.to_string(), "1 effect(s) failed during flush");
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].effect(), Some(id));
        assert!(failure.is_user_error());
    }

    #[test]
    fn guard_errors_are_not_user_errors() {
        let err = ReactiveError::ContextViolation { operation: "flush" };
        assert!(!err.is_user_error());
        assert_eq!(err.to_string(), "flush is not allowed inside a reactive context");
        assert_eq!(err.failures().len(), 1);
    }
}
