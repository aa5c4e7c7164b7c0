//! Effect Scheduler
//!
//! The scheduler holds every live effect and the set of effects waiting for
//! the next flush. Writes only queue effects; nothing runs until
//! [`Runtime::flush`](super::Runtime::flush).
//!
//! # Algorithm
//!
//! A flush processes the queue in passes:
//!
//! 1. If any `Root` effect is pending, the pass runs every pending `Root`
//!    effect in creation order.
//! 2. Otherwise the pass runs pending `View` effects in scope pre-order:
//!    a parent scope's effects before those of its descendants, effects of
//!    one scope in creation order. The pass stops early as soon as a `Root`
//!    effect becomes pending again.
//! 3. Before running, a maybe-dirty effect polls its producers. If none of
//!    them actually changed, it is marked clean and skipped.
//! 4. Effects dirtied during a pass are picked up by a later pass of the
//!    same flush, until the queue is empty or the pass limit is reached.
//!
//! A failing effect does not stop the flush. Failures are collected and
//! returned together once the queue has drained. If the pass limit cuts the
//! flush short, the limit error is appended to the failures collected so
//! far.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::effect::{EffectClass, EffectSlot};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtiedEffects, DirtyState, NodeId};

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Number of passes over the queue.
    pub passes: usize,
    /// Effects that ran.
    pub runs: usize,
    /// Maybe-dirty effects whose producers turned out unchanged.
    pub skipped: usize,
}

/// Live effects and the flush queue of one runtime.
#[derive(Default)]
pub(crate) struct EffectScheduler {
    effects: HashMap<NodeId, Rc<EffectSlot>>,
    pending: IndexSet<NodeId>,
    flushing: bool,
}

impl EffectScheduler {
    pub fn register(&mut self, slot: Rc<EffectSlot>) {
        self.effects.insert(slot.id(), slot);
    }

    /// Forget an effect, dropping it from the queue as well.
    pub fn remove(&mut self, id: NodeId) -> Option<Rc<EffectSlot>> {
        self.pending.shift_remove(&id);
        self.effects.remove(&id)
    }

    /// Queue the effects reached by a write.
    pub fn enqueue(&mut self, effects: DirtiedEffects) {
        for id in effects {
            if self.effects.contains_key(&id) {
                self.pending.insert(id);
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Rc<EffectSlot>> {
        self.effects.get(&id).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn pending_class(&self, class: EffectClass) -> impl Iterator<Item = NodeId> + '_ {
        self.pending
            .iter()
            .copied()
            .filter(move |id| self.effects.get(id).map(|slot| slot.class()) == Some(class))
    }

    fn has_pending_root(&self) -> bool {
        self.pending_class(EffectClass::Root).next().is_some()
    }

    /// Take `id` off the queue. Returns its slot if it was queued and is
    /// still alive.
    fn take(&mut self, id: NodeId) -> Option<Rc<EffectSlot>> {
        if self.pending.shift_remove(&id) {
            self.get(id)
        } else {
            None
        }
    }
}

/// Resets the `flushing` flag, even when an effect panics.
struct FlushingGuard<'a> {
    scheduler: &'a RefCell<EffectScheduler>,
}

impl<'a> FlushingGuard<'a> {
    /// Returns `None` if a flush is already in progress.
    fn enter(scheduler: &'a RefCell<EffectScheduler>) -> Option<Self> {
        let mut state = scheduler.borrow_mut();
        if state.flushing {
            return None;
        }
        state.flushing = true;
        drop(state);
        Some(Self { scheduler })
    }
}

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.borrow_mut().flushing = false;
    }
}

/// The next pass: all pending `Root` effects, or failing that all pending
/// `View` effects in scope order.
fn next_pass(rt: &Runtime) -> (EffectClass, Vec<NodeId>) {
    let scheduler = rt.scheduler().borrow();

    let mut roots: Vec<NodeId> = scheduler.pending_class(EffectClass::Root).collect();
    if !roots.is_empty() {
        roots.sort();
        return (EffectClass::Root, roots);
    }

    let views: Vec<NodeId> = scheduler.pending_class(EffectClass::View).collect();
    if views.is_empty() {
        return (EffectClass::View, Vec::new());
    }

    // Pending views whose owner is gone sort last.
    let scopes = rt.scopes();
    let mut keyed: Vec<_> = views
        .into_iter()
        .map(|id| {
            let position = rt.owner_of(id).and_then(|owner| scopes.position(owner));
            (position.is_none(), position, id)
        })
        .collect();
    keyed.sort();
    (EffectClass::View, keyed.into_iter().map(|(_, _, id)| id).collect())
}

/// Outcome of handling one queued effect.
enum Step {
    Ran(Result<()>),
    Skipped,
    Gone,
}

fn run_pending(rt: &Runtime, id: NodeId) -> Step {
    let Some(slot) = rt.scheduler().borrow_mut().take(id) else {
        return Step::Gone;
    };

    match rt.dirty_state_of(id) {
        None => return Step::Gone,
        Some(DirtyState::Dirty) => {}
        // Clean but queued means it was dirtied during its own last run.
        Some(DirtyState::MaybeDirty | DirtyState::Clean) => {
            if !rt.producers_changed(id) {
                rt.mark_clean(id);
                return Step::Skipped;
            }
        }
    }

    Step::Ran(slot.run(rt))
}

/// Run pending effects until the queue is empty.
pub(crate) fn flush(rt: &Runtime) -> Result<FlushReport> {
    rt.assert_not_in_reactive_context("flush")?;

    let Some(_flushing) = FlushingGuard::enter(rt.scheduler()) else {
        tracing::trace!("flush already in progress");
        return Ok(FlushReport::default());
    };

    let limit = rt.config().max_flush_passes;
    let mut report = FlushReport::default();
    let mut failures = Vec::new();

    loop {
        let (class, pass) = next_pass(rt);
        if pass.is_empty() {
            break;
        }
        if report.passes >= limit {
            tracing::warn!(
                passes = report.passes,
                pending = rt.pending_effects(),
                failures = failures.len(),
                "flush pass limit exceeded"
            );
            let exceeded = ReactiveError::FlushLimitExceeded {
                passes: report.passes,
            };
            if failures.is_empty() {
                return Err(exceeded);
            }
            failures.push(exceeded);
            return Err(ReactiveError::Flush(failures));
        }
        report.passes += 1;
        tracing::trace!(pass = report.passes, ?class, effects = pass.len(), "flush pass");

        for id in pass {
            if class == EffectClass::View && rt.scheduler().borrow().has_pending_root() {
                break;
            }
            match run_pending(rt, id) {
                Step::Ran(Ok(())) => report.runs += 1,
                Step::Ran(Err(err)) => {
                    report.runs += 1;
                    tracing::warn!(effect = %id, error = %err, "effect failed");
                    failures.push(err);
                }
                Step::Skipped => report.skipped += 1,
                Step::Gone => {}
            }
        }
    }

    tracing::debug!(
        passes = report.passes,
        runs = report.runs,
        skipped = report.skipped,
        failures = failures.len(),
        "flush complete"
    );

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(ReactiveError::Flush(failures))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::cell::Cell;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn logging_effect(scope: &crate::reactive::Scope, source: &crate::reactive::Signal<i32>, log: &Log, name: &'static str) {
        let (s, l) = (source.clone(), log.clone());
        scope
            .effect(move |_| {
                s.get();
                l.borrow_mut().push(name);
            })
            .unwrap();
    }

    #[test]
    fn flush_with_empty_queue_is_a_no_op() {
        let rt = Runtime::new();
        assert_eq!(rt.flush().unwrap(), FlushReport::default());
    }

    #[test]
    fn root_effects_run_before_view_effects() {
        let rt = Runtime::new();
        let root = rt.root();
        let view = root.child();
        let source = root.signal(0);
        let log: Log = Rc::default();

        // Created first, but in the View class
        logging_effect(&view, &source, &log, "view");
        logging_effect(&root, &source, &log, "root");
        log.borrow_mut().clear();

        source.set(1).unwrap();
        assert_eq!(rt.pending_effects(), 2);

        let report = rt.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["root", "view"]);
        assert_eq!(report.runs, 2);
        assert_eq!(report.passes, 2);
        assert_eq!(rt.pending_effects(), 0);
    }

    #[test]
    fn view_effects_run_parent_scope_first() {
        let rt = Runtime::new();
        let root = rt.root();
        let a = root.child();
        let a1 = a.child();
        let b = root.child();
        let source = root.signal(0);
        let log: Log = Rc::default();

        logging_effect(&b, &source, &log, "b");
        logging_effect(&a1, &source, &log, "a1");
        logging_effect(&a, &source, &log, "a");
        log.borrow_mut().clear();

        source.set(1).unwrap();
        rt.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "a1", "b"]);
    }

    #[test]
    fn root_effect_queued_by_view_runs_before_remaining_views() {
        let rt = Runtime::new();
        let root = rt.root();
        let first = root.child();
        let second = root.child();
        let source = root.signal(0);
        let relay = root.signal(0);
        let log: Log = Rc::default();

        let (s, r, l) = (source.clone(), relay.clone(), log.clone());
        first
            .effect(move |_| {
                let v = s.get();
                l.borrow_mut().push("first");
                r.set(v)
            })
            .unwrap();
        logging_effect(&second, &source, &log, "second");
        logging_effect(&root, &relay, &log, "root");
        log.borrow_mut().clear();

        source.set(1).unwrap();
        rt.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["first", "root", "second"]);
    }

    #[test]
    fn effect_with_unchanged_producers_is_skipped() {
        let rt = Runtime::new();
        let root = rt.root();
        let number = root.signal(0);
        let n = number.clone();
        let parity = root.computed(move || n.get() % 2);

        let runs = Rc::new(Cell::new(0));
        let (p, r) = (parity.clone(), runs.clone());
        root.effect(move |_| -> Result<()> {
            p.get()?;
            r.set(r.get() + 1);
            Ok(())
        })
        .unwrap();

        number.set(2).unwrap();
        let report = rt.flush().unwrap();
        assert_eq!(report.runs, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(runs.get(), 1);

        number.set(3).unwrap();
        let report = rt.flush().unwrap();
        assert_eq!(report.runs, 1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn failing_effect_does_not_stop_the_flush() {
        let rt = Runtime::new();
        let root = rt.root();
        let source = root.signal(0);
        let log: Log = Rc::default();

        let s = source.clone();
        let failing = root
            .effect(move |_| -> Result<()> {
                if s.get() > 0 {
                    return Err(ReactiveError::derivation("boom"));
                }
                Ok(())
            })
            .unwrap();
        logging_effect(&root, &source, &log, "healthy");
        log.borrow_mut().clear();

        source.set(1).unwrap();
        let err = rt.flush().unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].effect(), Some(failing.id()));
        assert_eq!(*log.borrow(), vec!["healthy"]);

        // Still subscribed after a failed run
        assert!(!failing.is_disposed());
        assert_eq!(rt.dependencies_of(failing.id()), vec![source.id()]);
    }

    #[test]
    fn runaway_effect_hits_pass_limit() {
        let rt = Runtime::with_config(RuntimeConfig::new().max_flush_passes(3));
        let root = rt.root();
        let counter = root.signal(0);

        let c = counter.clone();
        root.effect(move |_| {
            let v = c.get();
            c.set(v + 1)
        })
        .unwrap();
        assert_eq!(rt.pending_effects(), 1);

        let err = rt.flush().unwrap_err();
        assert!(matches!(err, ReactiveError::FlushLimitExceeded { passes: 3 }));
        assert_eq!(counter.get(), 4);
        assert_eq!(rt.pending_effects(), 1);
    }

    #[test]
    fn pass_limit_keeps_earlier_failures() {
        let rt = Runtime::with_config(RuntimeConfig::new().max_flush_passes(3));
        let root = rt.root();
        let counter = root.signal(0);
        let trigger = root.signal(0);

        let c = counter.clone();
        root.effect(move |_| {
            let v = c.get();
            c.set(v + 1)
        })
        .unwrap();
        let t = trigger.clone();
        let failing = root
            .effect(move |_| -> Result<()> {
                if t.get() > 0 {
                    return Err(ReactiveError::derivation("boom"));
                }
                Ok(())
            })
            .unwrap();

        trigger.set(1).unwrap();
        let err = rt.flush().unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].effect(), Some(failing.id()));
        assert!(failures[0].is_user_error());
        assert!(matches!(failures[1], ReactiveError::FlushLimitExceeded { passes: 3 }));
    }

    #[test]
    fn self_write_settles_within_one_flush() {
        let rt = Runtime::new();
        let root = rt.root();
        let counter = root.signal(0);

        let c = counter.clone();
        root.effect(move |_| -> Result<()> {
            let v = c.get();
            if v < 5 {
                c.set(v + 1)?;
            }
            Ok(())
        })
        .unwrap();

        let report = rt.flush().unwrap();
        assert_eq!(counter.get(), 5);
        assert_eq!(report.runs, 5);
        assert_eq!(rt.pending_effects(), 0);
    }

    #[test]
    fn flush_inside_effect_is_rejected() {
        let rt = Runtime::new();
        let outcome = Rc::new(RefCell::new(None));

        let (r, o) = (rt.clone(), outcome.clone());
        rt.root()
            .effect(move |_| {
                *o.borrow_mut() = Some(r.flush().is_err());
            })
            .unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
    }

    #[test]
    fn disposed_effect_leaves_the_queue() {
        let rt = Runtime::new();
        let root = rt.root();
        let source = root.signal(0);
        let log: Log = Rc::default();

        let (s, l) = (source.clone(), log.clone());
        let effect = root
            .effect(move |_| {
                s.get();
                l.borrow_mut().push("ran");
            })
            .unwrap();
        log.borrow_mut().clear();

        source.set(1).unwrap();
        assert_eq!(rt.pending_effects(), 1);
        effect.dispose();
        assert_eq!(rt.pending_effects(), 0);

        rt.flush().unwrap();
        assert!(log.borrow().is_empty());
    }
}
