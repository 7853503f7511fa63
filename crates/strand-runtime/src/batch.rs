#![forbid(unsafe_code)]

//! Pause/unpause batching of binding updates.
//!
//! While a [`Batcher`] is paused, scheduled binding updates are queued
//! instead of run. When the outermost pause ends, the queue is flushed:
//! every queued binding runs once, in the order it was first enqueued, no
//! matter how many times it was invalidated in between.
//!
//! # Usage
//!
//! ```ignore
//! let batcher = Rc::new(Batcher::new(&RuntimeConfig::default()));
//! {
//!     let _pause = batcher.pause_guard();
//!     batcher.schedule(slot.clone(), Notification::CHANGED); // deferred
//!     batcher.schedule(slot.clone(), Notification::CHANGED); // coalesced
//! } // flushed here, `slot` updates once
//! ```
//!
//! # Invariants
//!
//! 1. Nested pauses are supported: only the outermost unpause flushes.
//! 2. Scheduling while not paused runs the update immediately.
//! 3. Updates scheduled during a flush run in a further round of the same
//!    flush, up to `max_flush_rounds` rounds.
//! 4. A binding whose slot was retired before its turn is skipped.
//!
//! # Failure Modes
//!
//! - **Binding returns an error**: logged at warn, reported to the error
//!   sink, and the flush continues.
//! - **Binding panics**: remaining bindings are still run. The first panic
//!   is re-raised after the flush completes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, info_span, trace, warn};
use web_time::Instant;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::registry::BindingSlot;
use crate::view::{BindingId, Notification};

/// Callback receiving non-fatal flush errors.
pub type ErrorSink = Rc<dyn Fn(&RuntimeError)>;

/// Counters for one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rounds run (0 when nothing was queued).
    pub rounds: u32,
    /// Bindings whose update returned `Ok`.
    pub flushed: usize,
    /// Stale or detached bindings skipped.
    pub skipped: usize,
    /// Bindings whose update returned an error or panicked.
    pub failed: usize,
    /// Queued updates dropped at the round limit.
    pub dropped: usize,
    pub duration_us: u64,
}

#[derive(Default)]
struct PendingQueue {
    order: Vec<BindingId>,
    entries: FxHashMap<BindingId, (Rc<BindingSlot>, Notification)>,
}

impl PendingQueue {
    fn push(&mut self, slot: Rc<BindingSlot>, notification: Notification) {
        let id = slot.id();
        if let Some((_, queued)) = self.entries.get_mut(&id) {
            let prev = std::mem::replace(queued, Notification::Refresh);
            *queued = prev.merge(notification);
        } else {
            self.order.push(id);
            self.entries.insert(id, (slot, notification));
        }
    }

    fn take(&mut self) -> Vec<(Rc<BindingSlot>, Notification)> {
        let mut entries = std::mem::take(&mut self.entries);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Page-scoped suspend counter and pending update queue.
pub struct Batcher {
    depth: Cell<u32>,
    flushing: Cell<bool>,
    queue: RefCell<PendingQueue>,
    strict_pause: bool,
    max_flush_rounds: u32,
    error_sink: RefCell<Option<ErrorSink>>,
}

impl Batcher {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            depth: Cell::new(0),
            flushing: Cell::new(false),
            queue: RefCell::new(PendingQueue::default()),
            strict_pause: config.strict_pause,
            max_flush_rounds: config.max_flush_rounds.max(1),
            error_sink: RefCell::new(None),
        }
    }

    /// Route binding failures to `sink` in addition to the log.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.borrow_mut() = Some(sink);
    }

    /// Suspend binding execution.
    pub fn pause(&self) {
        self.depth.set(self.depth.get().saturating_add(1));
    }

    /// End one pause; the outermost unpause flushes.
    ///
    /// # Panics
    ///
    /// Without a matching pause, panics when `strict_pause` is set.
    /// Otherwise the call is logged and ignored.
    pub fn unpause(&self) -> FlushReport {
        match self.try_unpause() {
            Ok(report) => report,
            Err(err) => {
                if self.strict_pause {
                    panic!("{err}");
                }
                warn!(error = %err, "ignoring unbalanced unpause");
                FlushReport::default()
            }
        }
    }

    /// Like [`unpause`](Self::unpause), returning imbalance as an error.
    pub fn try_unpause(&self) -> Result<FlushReport, RuntimeError> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(RuntimeError::ImbalancedPause);
        }
        self.depth.set(depth - 1);
        if depth == 1 && !self.flushing.get() {
            Ok(self.flush())
        } else {
            Ok(FlushReport::default())
        }
    }

    /// Pause now, unpause when the guard drops.
    pub fn pause_guard(self: &Rc<Self>) -> PauseGuard {
        self.pause();
        PauseGuard {
            batcher: Rc::clone(self),
        }
    }

    /// Run `f` inside one pause scope.
    pub fn batch<R>(self: &Rc<Self>, f: impl FnOnce() -> R) -> R {
        let _pause = self.pause_guard();
        f()
    }

    /// Queue `notification` for the binding in `slot`.
    ///
    /// Returns `true` if the update was deferred, `false` if it ran
    /// immediately.
    pub fn schedule(&self, slot: Rc<BindingSlot>, notification: Notification) -> bool {
        self.queue.borrow_mut().push(slot, notification);
        if self.depth.get() == 0 && !self.flushing.get() {
            self.flush();
            false
        } else {
            true
        }
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.depth.get() > 0
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.get()
    }

    /// Distinct bindings currently queued.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Discard queued updates without running them.
    pub fn clear(&self) -> usize {
        let dropped = self.queue.borrow_mut().take().len();
        if dropped > 0 {
            debug!(dropped, "cleared pending binding updates");
        }
        dropped
    }

    fn release_without_flush(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    fn report_error(&self, err: &RuntimeError) {
        let sink = self.error_sink.borrow().clone();
        if let Some(sink) = sink {
            sink(err);
        }
    }

    fn flush(&self) -> FlushReport {
        if self.queue.borrow().is_empty() {
            return FlushReport::default();
        }

        let start = Instant::now();
        let span = info_span!(
            "strand.flush",
            rounds = tracing::field::Empty,
            bindings_flushed = tracing::field::Empty,
            skipped = tracing::field::Empty,
            failed = tracing::field::Empty,
            duration_us = tracing::field::Empty
        );
        let _enter = span.enter();

        self.flushing.set(true);
        let mut report = FlushReport::default();
        let mut first_panic: Option<Box<dyn std::any::Any + Send>> = None;

        loop {
            // Take the round before running it so updates can re-enter.
            let round = self.queue.borrow_mut().take();
            if round.is_empty() {
                break;
            }
            if report.rounds >= self.max_flush_rounds {
                report.dropped = round.len();
                warn!(
                    max_flush_rounds = self.max_flush_rounds,
                    dropped = round.len(),
                    "flush round limit reached, dropping queued updates"
                );
                break;
            }
            report.rounds += 1;

            for (slot, notification) in round {
                let id = slot.id();
                if !slot.is_live() || !slot.binding().is_attached() {
                    trace!(error = %RuntimeError::StaleBinding { binding: id }, "skipped binding");
                    report.skipped += 1;
                    continue;
                }
                let binding = Rc::clone(slot.binding());
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    binding.update(&notification)
                }));
                match result {
                    Ok(Ok(())) => report.flushed += 1,
                    Ok(Err(source)) => {
                        report.failed += 1;
                        warn!(binding = %id, error = %source, "binding update failed");
                        self.report_error(&RuntimeError::BindingFailed {
                            binding: id,
                            source,
                        });
                    }
                    Err(payload) => {
                        report.failed += 1;
                        warn!(binding = %id, "binding update panicked");
                        if first_panic.is_none() {
                            first_panic = Some(payload);
                        }
                    }
                }
            }
        }

        self.flushing.set(false);
        report.duration_us = start.elapsed().as_micros() as u64;
        span.record("rounds", report.rounds);
        span.record("bindings_flushed", report.flushed as u64);
        span.record("skipped", report.skipped as u64);
        span.record("failed", report.failed as u64);
        span.record("duration_us", report.duration_us);
        debug!(
            rounds = report.rounds,
            bindings_flushed = report.flushed,
            duration_us = report.duration_us,
            "flush complete"
        );

        if let Some(payload) = first_panic {
            std::panic::resume_unwind(payload);
        }
        report
    }
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("depth", &self.depth.get())
            .field("flushing", &self.flushing.get())
            .field("pending", &self.pending_count())
            .field("strict_pause", &self.strict_pause)
            .field("max_flush_rounds", &self.max_flush_rounds)
            .finish()
    }
}

/// RAII pause scope. Unpauses (and possibly flushes) on drop.
#[must_use = "dropping the guard ends the pause immediately"]
pub struct PauseGuard {
    batcher: Rc<Batcher>,
}

impl PauseGuard {
    #[must_use]
    pub fn batcher(&self) -> &Rc<Batcher> {
        &self.batcher
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.batcher.release_without_flush();
            return;
        }
        if let Err(err) = self.batcher.try_unpause() {
            warn!(error = %err, "pause guard released an unpaused batcher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindingError;
    use crate::view::{Binding, Context, Expression};
    use tracing_test::traced_test;

    type UpdateFn = Box<dyn Fn(&Notification) -> Result<(), BindingError>>;

    struct TestBinding {
        context: Context,
        log: Rc<RefCell<Vec<(u64, Notification)>>>,
        tag: u64,
        on_update: Option<UpdateFn>,
    }

    impl Binding for TestBinding {
        fn expressions(&self) -> &[Rc<dyn Expression>] {
            &[]
        }

        fn context(&self) -> &Context {
            &self.context
        }

        fn update(&self, notification: &Notification) -> Result<(), BindingError> {
            self.log.borrow_mut().push((self.tag, notification.clone()));
            match &self.on_update {
                Some(f) => f(notification),
                None => Ok(()),
            }
        }
    }

    type Log = Rc<RefCell<Vec<(u64, Notification)>>>;

    fn slot(tag: u64, log: &Log) -> Rc<BindingSlot> {
        slot_with(tag, log, None)
    }

    fn slot_with(tag: u64, log: &Log, on_update: Option<UpdateFn>) -> Rc<BindingSlot> {
        let binding = Rc::new(TestBinding {
            context: Context::default(),
            log: Rc::clone(log),
            tag,
            on_update,
        });
        Rc::new(BindingSlot::new(BindingId(tag), binding, None, None))
    }

    fn batcher() -> Rc<Batcher> {
        Rc::new(Batcher::new(&RuntimeConfig::default()))
    }

    fn tags(log: &Log) -> Vec<u64> {
        log.borrow().iter().map(|(tag, _)| *tag).collect()
    }

    #[test]
    fn unpaused_schedule_runs_immediately() {
        let log = Log::default();
        let batcher = batcher();
        assert!(!batcher.schedule(slot(1, &log), Notification::CHANGED));
        assert_eq!(tags(&log), vec![1]);
    }

    #[test]
    fn nested_pause_flushes_on_outermost_unpause() {
        let log = Log::default();
        let batcher = batcher();
        let a = slot(1, &log);
        let b = slot(2, &log);

        batcher.pause();
        batcher.pause();
        batcher.schedule(a.clone(), Notification::CHANGED);
        batcher.schedule(b.clone(), Notification::CHANGED);
        batcher.schedule(a.clone(), Notification::CHANGED);
        let inner = batcher.unpause();
        assert_eq!(inner, FlushReport::default());
        assert!(log.borrow().is_empty());

        let outer = batcher.unpause();
        assert_eq!(tags(&log), vec![1, 2]);
        assert_eq!(outer.rounds, 1);
        assert_eq!(outer.flushed, 2);
    }

    #[test]
    fn coalesces_by_binding_identity() {
        let log = Log::default();
        let batcher = batcher();
        let a = slot(1, &log);
        let b = slot(2, &log);

        batcher.batch(|| {
            batcher.schedule(b.clone(), Notification::Inserted { index: 0, count: 1 });
            batcher.schedule(a.clone(), Notification::CHANGED);
            batcher.schedule(a.clone(), Notification::CHANGED);
            batcher.schedule(b.clone(), Notification::Removed { index: 0, count: 1 });
            assert_eq!(batcher.pending_count(), 2);
        });

        assert_eq!(
            *log.borrow(),
            vec![(2, Notification::Refresh), (1, Notification::CHANGED)]
        );
    }

    #[test]
    fn retired_slots_are_skipped() {
        let log = Log::default();
        let batcher = batcher();
        let a = slot(1, &log);
        let b = slot(2, &log);

        batcher.pause();
        batcher.schedule(a.clone(), Notification::CHANGED);
        batcher.schedule(b.clone(), Notification::CHANGED);
        a.retire();
        let report = batcher.unpause();

        assert_eq!(tags(&log), vec![2]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.flushed, 1);
    }

    #[test]
    fn failing_binding_does_not_stop_flush() {
        let log = Log::default();
        let errors: Rc<RefCell<Vec<String>>> = Rc::default();
        let batcher = batcher();
        let sink_errors = Rc::clone(&errors);
        batcher.set_error_sink(Rc::new(move |err: &RuntimeError| {
            sink_errors.borrow_mut().push(err.to_string());
        }));

        let bad = slot_with(
            1,
            &log,
            Some(Box::new(|_: &Notification| -> Result<(), BindingError> {
                Err(BindingError::Update("boom".into()))
            })),
        );
        let good = slot(2, &log);

        batcher.pause();
        batcher.schedule(bad, Notification::CHANGED);
        batcher.schedule(good, Notification::CHANGED);
        let report = batcher.unpause();

        assert_eq!(tags(&log), vec![1, 2]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.flushed, 1);
        assert_eq!(*errors.borrow(), vec!["binding B1 failed to update".to_string()]);
    }

    #[test]
    fn panic_is_reraised_after_flush() {
        let log = Log::default();
        let batcher = batcher();
        let bad = slot_with(
            1,
            &log,
            Some(Box::new(|_: &Notification| -> Result<(), BindingError> {
                panic!("binding exploded")
            })),
        );
        let good = slot(2, &log);

        batcher.pause();
        batcher.schedule(bad, Notification::CHANGED);
        batcher.schedule(good, Notification::CHANGED);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| batcher.unpause()));

        assert!(result.is_err());
        assert_eq!(tags(&log), vec![1, 2]);
        assert!(!batcher.is_flushing());
        assert!(!batcher.is_paused());
    }

    #[test]
    fn updates_scheduled_during_flush_run_in_next_round() {
        let log = Log::default();
        let batcher = batcher();
        let follower = slot(2, &log);
        let inner_batcher = Rc::clone(&batcher);
        let inner_follower = Rc::clone(&follower);
        let leader = slot_with(
            1,
            &log,
            Some(Box::new(move |_: &Notification| -> Result<(), BindingError> {
                inner_batcher.schedule(inner_follower.clone(), Notification::CHANGED);
                Ok(())
            })),
        );

        batcher.pause();
        batcher.schedule(leader, Notification::CHANGED);
        let report = batcher.unpause();

        assert_eq!(tags(&log), vec![1, 2]);
        assert_eq!(report.rounds, 2);
    }

    #[test]
    fn round_limit_drops_remaining_updates() {
        let log = Log::default();
        let config = RuntimeConfig {
            max_flush_rounds: 3,
            ..RuntimeConfig::default()
        };
        let batcher = Rc::new(Batcher::new(&config));
        let me: Rc<RefCell<Option<Rc<BindingSlot>>>> = Rc::default();
        let inner_me = Rc::clone(&me);
        let inner_batcher = Rc::clone(&batcher);
        let looping = slot_with(
            1,
            &log,
            Some(Box::new(move |_: &Notification| -> Result<(), BindingError> {
                if let Some(slot) = inner_me.borrow().clone() {
                    inner_batcher.schedule(slot, Notification::CHANGED);
                }
                Ok(())
            })),
        );
        *me.borrow_mut() = Some(looping.clone());

        batcher.pause();
        batcher.schedule(looping, Notification::CHANGED);
        let report = batcher.unpause();
        me.borrow_mut().take();

        assert_eq!(report.rounds, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(batcher.pending_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unpause called without a matching pause")]
    fn strict_imbalance_panics() {
        let config = RuntimeConfig {
            strict_pause: true,
            ..RuntimeConfig::default()
        };
        Batcher::new(&config).unpause();
    }

    #[test]
    fn lenient_imbalance_is_ignored() {
        let config = RuntimeConfig {
            strict_pause: false,
            ..RuntimeConfig::default()
        };
        let batcher = Batcher::new(&config);
        assert_eq!(batcher.unpause(), FlushReport::default());
        assert!(matches!(
            batcher.try_unpause(),
            Err(RuntimeError::ImbalancedPause)
        ));
        assert_eq!(batcher.depth(), 0);
    }

    #[test]
    fn guard_unpauses_on_drop() {
        let log = Log::default();
        let batcher = batcher();
        {
            let _guard = batcher.pause_guard();
            batcher.schedule(slot(1, &log), Notification::CHANGED);
            assert!(batcher.is_paused());
            assert!(log.borrow().is_empty());
        }
        assert!(!batcher.is_paused());
        assert_eq!(tags(&log), vec![1]);
    }

    #[test]
    #[traced_test]
    fn lenient_imbalance_warns() {
        let config = RuntimeConfig {
            strict_pause: false,
            ..RuntimeConfig::default()
        };
        Batcher::new(&config).unpause();
        assert!(logs_contain("ignoring unbalanced unpause"));
    }

    #[test]
    #[traced_test]
    fn round_limit_is_logged() {
        let log = Log::default();
        let config = RuntimeConfig {
            max_flush_rounds: 1,
            ..RuntimeConfig::default()
        };
        let batcher = Rc::new(Batcher::new(&config));
        let inner_batcher = Rc::clone(&batcher);
        let inner_log = Rc::clone(&log);
        let first = slot_with(
            1,
            &log,
            Some(Box::new(move |_: &Notification| -> Result<(), BindingError> {
                inner_batcher.schedule(slot(2, &inner_log), Notification::CHANGED);
                Ok(())
            })),
        );

        batcher.schedule(first, Notification::CHANGED);

        assert_eq!(tags(&log), vec![1]);
        assert!(logs_contain("flush round limit reached"));
    }

    #[test]
    fn clear_discards_queue() {
        let log = Log::default();
        let batcher = batcher();
        batcher.pause();
        batcher.schedule(slot(1, &log), Notification::CHANGED);
        assert_eq!(batcher.clear(), 1);
        batcher.unpause();
        assert!(log.borrow().is_empty());
    }
}
