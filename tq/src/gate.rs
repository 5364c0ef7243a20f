//! Admission gate
//!
//! Decides whether the next pending task may be dispatched now, and if only
//! an interval is in the way, how long to wait before checking again.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::QueueOptions;

/// Added to every computed wait so the retry timer never fires a hair early
pub const SAFETY_MARGIN: Duration = Duration::from_millis(5);

/// Snapshot of the queue state the gate looks at
#[derive(Debug, Clone, Copy)]
pub struct GateView {
    pub pending: usize,
    pub in_progress: usize,
    pub running: bool,
    pub last_started: Option<Instant>,
    pub last_finished: Option<Instant>,
}

/// Why nothing should be scheduled right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    Empty,
    NotRunning,
    AtCapacity,
}

/// Outcome of one gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch the head of the pending queue
    Admit,
    /// Only an interval blocks; check again after this delay
    Wait(Duration),
    /// A future push, resume or completion will re-trigger the gate
    Idle(IdleReason),
}

/// Constraint values for one gate check
///
/// Resolving runs caller-supplied interval closures, so it happens before the
/// queue takes its state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub concurrency: usize,
    pub by_start: Duration,
    pub by_finished: Duration,
}

impl Limits {
    /// Resolve each interval exactly once
    pub fn resolve(options: &QueueOptions) -> Self {
        let limits = Self {
            concurrency: options.concurrency,
            by_start: options.interval_by_start.resolve(),
            by_finished: options.interval_by_finished.resolve(),
        };
        trace!(?limits, "Limits::resolve");
        limits
    }

    /// Interval time still to run before a dispatch may start
    fn remaining(&self, view: &GateView, now: Instant) -> (Duration, Duration) {
        (
            remaining(self.by_start, view.last_started, now),
            remaining(self.by_finished, view.last_finished, now),
        )
    }
}

/// Time left until `interval` has passed since `since`
fn remaining(interval: Duration, since: Option<Instant>, now: Instant) -> Duration {
    match since {
        Some(at) => interval.saturating_sub(now.saturating_duration_since(at)),
        None => Duration::ZERO,
    }
}

/// Full gate check
pub fn decide(limits: &Limits, view: &GateView, now: Instant) -> Decision {
    if view.pending == 0 {
        return Decision::Idle(IdleReason::Empty);
    }
    if !view.running {
        return Decision::Idle(IdleReason::NotRunning);
    }
    if limits.concurrency > 0 && view.in_progress >= limits.concurrency {
        return Decision::Idle(IdleReason::AtCapacity);
    }

    let (by_start, by_finished) = limits.remaining(view, now);
    trace!(?by_start, ?by_finished, "gate::decide: remaining intervals");

    if by_start.is_zero() && by_finished.is_zero() {
        Decision::Admit
    } else {
        Decision::Wait(by_start.max(by_finished) + SAFETY_MARGIN)
    }
}

/// Whether a task may be dispatched right now
pub fn allowed(limits: &Limits, view: &GateView, now: Instant) -> bool {
    decide(limits, view, now) == Decision::Admit
}

/// Delay before the interval constraints could next admit a task
///
/// Zero when nothing is pending.
pub fn delay_until_next_check(limits: &Limits, view: &GateView, now: Instant) -> Duration {
    if view.pending == 0 {
        return Duration::ZERO;
    }
    let (by_start, by_finished) = limits.remaining(view, now);
    by_start.max(by_finished) + SAFETY_MARGIN
}
