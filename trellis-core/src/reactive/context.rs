//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a node is read, we can
//! register the current computation as a dependent.
//!
//! # Implementation
//!
//! Each runtime owns one frame stack. When a computed value derives or an
//! effect runs, a frame for that consumer is pushed; reads performed while
//! the frame is on top are collected into it. When the computation
//! completes, the frame is popped and its reads become the consumer's new
//! dependency set.
//!
//! The stack supports nesting (a computed reading another computed) and
//! untracked frames, which hide the frames below them from reads.

use std::cell::RefCell;

use indexmap::IndexMap;

use crate::graph::NodeId;

/// What kind of computation pushed a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A computed or linked value deriving its value. Writes are forbidden.
    Derivation,

    /// An effect body.
    Effect,

    /// `Runtime::untracked`. Reads are not recorded.
    Untracked,
}

/// An entry in the reactive context stack.
#[derive(Debug)]
struct Frame {
    consumer: Option<NodeId>,
    kind: FrameKind,
    /// Producers read during this frame, with the version seen.
    observed: IndexMap<NodeId, u64>,
    /// First signal written while this derivation frame was running.
    write_violation: Option<NodeId>,
}

/// Reads collected by a frame that completed normally.
#[derive(Debug, Default)]
pub(crate) struct FinishedFrame {
    pub observed: IndexMap<NodeId, u64>,
    pub write_violation: Option<NodeId>,
}

/// Per-runtime stack of tracking frames.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    stack: RefCell<Vec<Frame>>,
}

impl Tracker {
    /// Push a tracking frame for `consumer`.
    ///
    /// The frame is popped when the returned guard is finished or dropped.
    pub fn enter(&self, consumer: NodeId, kind: FrameKind) -> TrackingGuard<'_> {
        self.push(Some(consumer), kind)
    }

    /// Push a frame that suspends tracking until the guard is dropped.
    pub fn enter_untracked(&self) -> TrackingGuard<'_> {
        self.push(None, FrameKind::Untracked)
    }

    fn push(&self, consumer: Option<NodeId>, kind: FrameKind) -> TrackingGuard<'_> {
        let mut stack = self.stack.borrow_mut();
        stack.push(Frame {
            consumer,
            kind,
            observed: IndexMap::new(),
            write_violation: None,
        });

        TrackingGuard {
            tracker: self,
            depth: stack.len(),
            consumer,
            finished: false,
        }
    }

    /// Whether reads are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.current_consumer().is_some()
    }

    /// The consumer recording reads right now, if any.
    pub fn current_consumer(&self) -> Option<NodeId> {
        self.stack
            .borrow()
            .last()
            .filter(|frame| frame.kind != FrameKind::Untracked)
            .and_then(|frame| frame.consumer)
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Record a read of `node` at `version`.
    ///
    /// Returns the consumer the read was recorded for, so the caller can add
    /// the edge to the graph.
    pub fn record(&self, node: NodeId, version: u64) -> Option<NodeId> {
        let mut stack = self.stack.borrow_mut();
        let frame = stack.last_mut().filter(|frame| frame.kind != FrameKind::Untracked)?;
        let consumer = frame.consumer?;
        if consumer == node {
            return None;
        }
        frame.observed.insert(node, version);
        Some(consumer)
    }

    /// Flag the innermost derivation on the stack as having attempted a
    /// write to `signal`. Returns the derivation's consumer, or `None` when
    /// no derivation is running and the write is allowed.
    pub fn flag_write(&self, signal: NodeId) -> Option<NodeId> {
        let mut stack = self.stack.borrow_mut();
        let frame = stack
            .iter_mut()
            .rev()
            .find(|frame| frame.kind == FrameKind::Derivation)?;
        frame.write_violation.get_or_insert(signal);
        frame.consumer
    }
}

/// Guard that pops the frame when dropped.
///
/// This keeps the stack balanced even if the computation panics.
#[must_use = "dropping the guard immediately pops the frame"]
pub(crate) struct TrackingGuard<'a> {
    tracker: &'a Tracker,
    depth: usize,
    consumer: Option<NodeId>,
    finished: bool,
}

impl TrackingGuard<'_> {
    /// Pop the frame and return what it observed.
    pub fn finish(mut self) -> FinishedFrame {
        self.finished = true;
        self.pop()
            .map(|frame| FinishedFrame {
                observed: frame.observed,
                write_violation: frame.write_violation,
            })
            .unwrap_or_default()
    }

    fn pop(&self) -> Option<Frame> {
        let mut stack = self.tracker.stack.borrow_mut();
        debug_assert_eq!(
            stack.len(),
            self.depth,
            "tracking frames popped out of order"
        );
        let frame = stack.pop();
        if let Some(frame) = &frame {
            debug_assert_eq!(frame.consumer, self.consumer, "tracking frame mismatch");
        }
        frame
    }
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}
