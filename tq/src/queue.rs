//! Throttled queue: lifecycle controller and public handle
//!
//! Owns the store, gate inputs and stats behind one mutex. Work is never run
//! inline from a control call: dispatch happens on a spawned tick, interval
//! waits on a spawned timer. At most one of each is outstanding.
//!
//! Events are recorded into an outbox while the state lock is held and
//! delivered afterwards by a single drainer, so listeners and subscribers
//! see them in state order on any runtime flavor. Interval closures and
//! listeners never run under the lock.

use std::collections::VecDeque;
use std::fmt;
use std::ops::RangeBounds;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::clock;
use crate::config::QueueOptions;
use crate::events::{EventHub, EventKind, ListenerId, QueueEvent};
use crate::gate::{self, Decision, GateView, Limits};
use crate::stats::{QueueStats, StatsCollector};
use crate::store::{Finish, QueueStore};
use crate::task::{self, Args, CompletionKey, CompletionSink, Done, Task, TaskRecord};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Paused,
    Running,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Stopped => "stopped",
            State::Paused => "paused",
            State::Running => "running",
        };
        f.write_str(s)
    }
}

/// Internal state protected by mutex
struct QueueInner {
    state: State,
    store: QueueStore,
    options: QueueOptions,
    /// Bumped by every start from Stopped
    cycle: u64,
    last_started: Option<Instant>,
    last_finished: Option<Instant>,
    tick_scheduled: bool,
    timer_armed: bool,
    /// Invalidates an armed timer when the options change
    timer_generation: u64,
    stats: StatsCollector,
    /// Events in the order their state changes happened, not yet delivered
    outbox: VecDeque<QueueEvent>,
    /// Some thread is delivering the outbox
    draining: bool,
}

impl QueueInner {
    fn view(&self) -> GateView {
        GateView {
            pending: self.store.len(),
            in_progress: self.store.in_progress_len(),
            running: self.state == State::Running,
            last_started: self.last_started,
            last_finished: self.last_finished,
        }
    }

    fn drained(&self) -> bool {
        self.store.in_progress_len() == 0
    }

    fn push_event(&mut self, event: QueueEvent) {
        self.outbox.push_back(event);
    }
}

struct Shared {
    inner: Mutex<QueueInner>,
    events: EventHub,
    runtime: Handle,
    me: Weak<Shared>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver recorded events, oldest first
    ///
    /// One caller drains at a time. A caller that finds a drain in progress
    /// (on another thread, or a listener calling back into the queue) leaves
    /// its events to that drain, so delivery order always matches the order
    /// the events were recorded under the state lock.
    fn flush(&self) {
        {
            let mut inner = self.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        loop {
            let next = {
                let mut inner = self.lock();
                let next = inner.outbox.pop_front();
                if next.is_none() {
                    inner.draining = false;
                }
                next
            };
            match next {
                Some(event) => self.events.emit(event),
                None => return,
            }
        }
    }

    /// Resolve the intervals against the current options
    ///
    /// Interval closures are caller code and run with no lock held.
    fn limits(&self) -> Limits {
        let options = self.lock().options.clone();
        Limits::resolve(&options)
    }

    /// Run the gate against the current state and schedule whatever it asks for
    fn replan(&self) {
        let limits = self.limits();
        {
            let mut inner = self.lock();
            let decision = gate::decide(&limits, &inner.view(), clock::now());
            self.arm(&mut inner, decision);
        }
        self.flush();
    }

    fn arm(&self, inner: &mut QueueInner, decision: Decision) {
        trace!(?decision, tick = inner.tick_scheduled, timer = inner.timer_armed, "ThrottledQueue::arm");
        match decision {
            Decision::Admit => {
                if !inner.tick_scheduled {
                    inner.tick_scheduled = true;
                    let weak = self.me.clone();
                    self.runtime.spawn(async move {
                        if let Some(shared) = weak.upgrade() {
                            shared.tick();
                        }
                    });
                }
            }
            Decision::Wait(delay) if !inner.tick_scheduled && !inner.timer_armed => {
                debug!(?delay, "ThrottledQueue::arm: arming retry timer");
                inner.timer_armed = true;
                let generation = inner.timer_generation;
                let weak = self.me.clone();
                self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.timer_fired(generation, delay);
                    }
                });
                inner.push_event(QueueEvent::WaitingStart { delay });
            }
            Decision::Wait(_) | Decision::Idle(_) => {}
        }
    }

    fn timer_fired(&self, generation: u64, delay: Duration) {
        {
            let mut inner = self.lock();
            if inner.timer_generation != generation {
                trace!(generation, "ThrottledQueue::timer_fired: superseded timer");
                return;
            }
            inner.timer_armed = false;
            inner.push_event(QueueEvent::WaitingEnd { delay });
        }
        self.replan();
    }

    /// Dispatch at most one task
    fn tick(&self) {
        let limits = self.limits();
        let record = {
            let mut inner = self.lock();
            inner.tick_scheduled = false;
            let now = clock::now();
            let decision = gate::decide(&limits, &inner.view(), now);
            if decision != Decision::Admit {
                debug!(?decision, "ThrottledQueue::tick: gate closed since scheduling");
                self.arm(&mut inner, decision);
                drop(inner);
                self.flush();
                return;
            }

            let cycle = inner.cycle;
            let Some(record) = inner.store.dequeue(cycle, now) else {
                return;
            };
            inner.last_started = Some(now);
            let (state, in_progress) = (inner.state, inner.store.in_progress_len());
            inner.stats.on_dispatch(now, state, in_progress);
            inner.push_event(QueueEvent::TaskStart {
                dispatch_id: record.dispatch_id(),
                task: record.task().clone(),
            });
            record
        };

        debug!(dispatch_id = %record.dispatch_id(), task = ?record.task().name(), "ThrottledQueue::tick: dispatching");
        self.replan();

        let key = CompletionKey {
            dispatch_id: record.dispatch_id(),
            cycle: record.cycle(),
        };
        let sink: Weak<dyn CompletionSink> = self.me.clone();
        if let Err(payload) = task::run(record.task(), Done::new(key, sink)) {
            warn!(dispatch_id = %record.dispatch_id(), "ThrottledQueue::tick: task panicked, resuming unwind");
            std::panic::resume_unwind(payload);
        }
    }

    /// Record the events owed once a current-cycle completion is in; returns
    /// whether the gate should be checked again
    fn after_completion(&self, inner: &mut QueueInner) -> bool {
        if inner.drained() && inner.state == State::Paused {
            inner.push_event(QueueEvent::Paused);
        }
        if inner.drained() && inner.store.len() == 0 {
            inner.push_event(QueueEvent::Empty);
            if inner.state == State::Stopped {
                inner.push_event(QueueEvent::Stopped);
            }
            false
        } else {
            true
        }
    }
}

impl CompletionSink for Shared {
    fn complete(&self, key: CompletionKey, args: Args) {
        let replan = {
            let mut inner = self.lock();
            let now = clock::now();
            let cycle = inner.cycle;
            match inner.store.complete(key, cycle, now) {
                Finish::Current(record) => {
                    inner.last_finished = Some(now);
                    let (state, in_progress) = (inner.state, inner.store.in_progress_len());
                    inner.stats.on_finish(now, state, in_progress, true);
                    debug!(dispatch_id = %key.dispatch_id, seq = ?record.seq(), "ThrottledQueue::complete: finished");
                    let task = record.task().clone();
                    inner.push_event(QueueEvent::TaskEnd { args, record, task });
                    self.after_completion(&mut inner)
                }
                Finish::Stale(record) => {
                    inner.last_finished = Some(now);
                    let (state, in_progress) = (inner.state, inner.store.in_progress_len());
                    inner.stats.on_finish(now, state, in_progress, false);
                    warn!(
                        dispatch_id = %key.dispatch_id,
                        cycle = key.cycle,
                        current = cycle,
                        "ThrottledQueue::complete: completion from an earlier cycle"
                    );
                    let task = record.task().clone();
                    inner.push_event(QueueEvent::TaskEnd { args, record, task });
                    false
                }
                Finish::Unknown => {
                    error!(dispatch_id = %key.dispatch_id, "ThrottledQueue::complete: dispatch not in progress");
                    debug_assert!(false, "completion for unknown dispatch {}", key.dispatch_id);
                    false
                }
            }
        };
        if replan {
            self.replan();
        } else {
            self.flush();
        }
    }
}

/// Queue that runs tasks under a concurrency cap and two spacing intervals
///
/// Cloning gives another handle to the same queue. Every method returns
/// immediately; dispatch happens later on the tokio runtime the queue was
/// created on.
///
/// ```no_run
/// # async fn demo() {
/// use serde_json::json;
/// use throttled_queue::{Interval, QueueOptions, Task, ThrottledQueue};
///
/// let queue = ThrottledQueue::with_options(
///     QueueOptions::default()
///         .with_concurrency(2)
///         .with_interval_by_start(Interval::from_millis(100)),
/// );
/// queue.start([Task::sync(|| json!("hello"))]);
/// # }
/// ```
#[derive(Clone)]
pub struct ThrottledQueue {
    shared: Arc<Shared>,
}

impl ThrottledQueue {
    /// Queue with default options (concurrency 1, no intervals)
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    /// Queue with the given options, initially stopped
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_options(options: QueueOptions) -> Self {
        debug!(?options, "ThrottledQueue::with_options: called");
        let runtime = Handle::current();
        let now = clock::now();
        let shared = Arc::new_cyclic(|me| Shared {
            inner: Mutex::new(QueueInner {
                state: State::Stopped,
                store: QueueStore::new(),
                options,
                cycle: 0,
                last_started: None,
                last_finished: None,
                tick_scheduled: false,
                timer_armed: false,
                timer_generation: 0,
                stats: StatsCollector::new(now),
                outbox: VecDeque::new(),
                draining: false,
            }),
            events: EventHub::default(),
            runtime,
            me: me.clone(),
        });
        Self { shared }
    }

    /// Replace the options and re-check the gate
    pub fn set_options(&self, options: QueueOptions) -> &Self {
        debug!(?options, "ThrottledQueue::set_options: called");
        {
            let mut inner = self.shared.lock();
            inner.options = options;
            inner.timer_generation += 1;
            inner.timer_armed = false;
        }
        self.shared.replan();
        self
    }

    /// Copy of the current options
    pub fn options(&self) -> QueueOptions {
        self.shared.lock().options.clone()
    }

    /// Add tasks and begin (or continue) dispatching
    ///
    /// From Stopped this starts a new cycle: sequence numbers and the
    /// in-progress/finished lists are reset. Pending tasks are kept.
    pub fn start(&self, tasks: impl IntoIterator<Item = Task>) -> &Self {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        debug!(count = tasks.len(), "ThrottledQueue::start: called");
        let state = {
            let mut inner = self.shared.lock();
            inner.store.push(tasks);
            let state = inner.state;
            if state == State::Stopped {
                debug!("ThrottledQueue::start: stopped branch, new cycle");
                let now = clock::now();
                inner.cycle += 1;
                inner.store.reset_cycle();
                inner.state = State::Running;
                inner.stats.on_start(now, 0);
                info!(cycle = inner.cycle, pending = inner.store.len(), "Queue started");

                inner.push_event(QueueEvent::Start);
                if inner.store.len() == 0 {
                    inner.push_event(QueueEvent::Empty);
                }
            }
            state
        };
        match state {
            State::Paused => {
                debug!("ThrottledQueue::start: paused branch, resuming");
                self.resume();
            }
            State::Running => {
                debug!("ThrottledQueue::start: already running");
                self.shared.replan();
            }
            State::Stopped => self.shared.replan(),
        }
        self
    }

    /// Stop dispatching new tasks; running ones finish normally
    pub fn pause(&self) -> &Self {
        debug!("ThrottledQueue::pause: called");
        {
            let mut inner = self.shared.lock();
            if inner.state != State::Running {
                debug!(state = %inner.state, "ThrottledQueue::pause: not running, ignoring");
                return self;
            }
            inner.state = State::Paused;
            let in_progress = inner.store.in_progress_len();
            inner.stats.on_pause(clock::now(), in_progress);
            info!(in_progress, "Queue paused");

            inner.push_event(QueueEvent::Pause);
            if inner.drained() {
                inner.push_event(QueueEvent::Paused);
            }
        }
        self.shared.flush();
        self
    }

    /// Continue after `pause`; from Stopped this is `start` with no tasks
    pub fn resume(&self) -> &Self {
        debug!("ThrottledQueue::resume: called");
        {
            let mut inner = self.shared.lock();
            let state = inner.state;
            match state {
                State::Running => {
                    debug!("ThrottledQueue::resume: already running, ignoring");
                    return self;
                }
                State::Stopped => {
                    drop(inner);
                    debug!("ThrottledQueue::resume: stopped branch, delegating to start");
                    return self.start(std::iter::empty());
                }
                State::Paused => {
                    inner.state = State::Running;
                    let in_progress = inner.store.in_progress_len();
                    inner.stats.on_resume(clock::now(), in_progress);
                    info!(pending = inner.store.len(), "Queue resumed");
                    inner.push_event(QueueEvent::Resume);
                }
            }
        }
        self.shared.replan();
        self
    }

    /// End the cycle; nothing new is dispatched until `start`/`resume`
    pub fn stop(&self) -> &Self {
        debug!("ThrottledQueue::stop: called");
        {
            let mut inner = self.shared.lock();
            if inner.state == State::Stopped {
                debug!("ThrottledQueue::stop: already stopped, ignoring");
                return self;
            }
            inner.state = State::Stopped;
            let in_progress = inner.store.in_progress_len();
            inner.stats.on_stop(clock::now(), in_progress);
            info!(in_progress, pending = inner.store.len(), "Queue stopped");

            inner.push_event(QueueEvent::Stop);
            if inner.drained() && inner.store.len() == 0 {
                inner.push_event(QueueEvent::Stopped);
            }
        }
        self.shared.flush();
        self
    }

    pub fn state(&self) -> State {
        self.shared.lock().state
    }

    pub fn is_paused(&self) -> bool {
        self.state() == State::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Apply a pending-list mutation, then re-check the gate if it added tasks
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueStore) -> (R, bool)) -> R {
        let (result, replan) = {
            let mut inner = self.shared.lock();
            let (result, added) = f(&mut inner.store);
            (result, added && inner.state == State::Running)
        };
        if replan {
            self.shared.replan();
        }
        result
    }

    /// Append tasks; returns the new pending length
    pub fn push(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        debug!("ThrottledQueue::push: called");
        self.mutate(|store| {
            let before = store.len();
            let len = store.push(tasks);
            (len, len > before)
        })
    }

    /// Insert tasks at the head, in the given order; returns the new pending length
    pub fn unshift(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        debug!("ThrottledQueue::unshift: called");
        self.mutate(|store| {
            let before = store.len();
            let len = store.unshift(tasks);
            (len, len > before)
        })
    }

    /// Remove the last pending task
    pub fn pop(&self) -> Option<Task> {
        debug!("ThrottledQueue::pop: called");
        self.mutate(|store| (store.pop(), false))
    }

    /// Remove the first pending task
    pub fn shift(&self) -> Option<Task> {
        debug!("ThrottledQueue::shift: called");
        self.mutate(|store| (store.shift(), false))
    }

    /// Reverse pending in place; returns the new order
    pub fn reverse(&self) -> Vec<Task> {
        debug!("ThrottledQueue::reverse: called");
        self.mutate(|store| {
            store.reverse();
            (store.tasks(), false)
        })
    }

    /// Copy of a range of pending tasks
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Vec<Task> {
        self.shared.lock().store.slice(range)
    }

    /// Remove `delete_count` pending tasks at `start` and insert `tasks` in their place
    pub fn splice(&self, start: usize, delete_count: usize, tasks: impl IntoIterator<Item = Task>) -> Vec<Task> {
        debug!(start, delete_count, "ThrottledQueue::splice: called");
        let tasks: Vec<Task> = tasks.into_iter().collect();
        let added = !tasks.is_empty();
        self.mutate(|store| (store.splice(start, delete_count, tasks), added))
    }

    pub fn index_of(&self, task: &Task) -> Option<usize> {
        self.shared.lock().store.index_of(task)
    }

    pub fn last_index_of(&self, task: &Task) -> Option<usize> {
        self.shared.lock().store.last_index_of(task)
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.shared.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of pending tasks in dispatch order
    pub fn tasks(&self) -> Vec<Task> {
        self.shared.lock().store.tasks()
    }

    /// Records of tasks running in the current cycle
    pub fn tasks_in_progress(&self) -> Vec<TaskRecord> {
        self.shared.lock().store.in_progress()
    }

    /// Records of tasks finished in the current cycle, in completion order
    pub fn tasks_finished(&self) -> Vec<TaskRecord> {
        self.shared.lock().store.finished()
    }

    /// Drop the finished records, returning them
    pub fn clear_finished(&self) -> Vec<TaskRecord> {
        debug!("ThrottledQueue::clear_finished: called");
        self.shared.lock().store.clear_finished()
    }

    /// Stats across all cycles so far
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.snapshot(clock::now())
    }

    /// Add a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, f)
    }

    /// Add a listener that fires at most once
    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(kind, f)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    /// Receive every event as it is emitted
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }
}

impl Default for ThrottledQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThrottledQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ThrottledQueue")
            .field("state", &inner.state)
            .field("cycle", &inner.cycle)
            .field("pending", &inner.store.len())
            .field("in_progress", &inner.store.in_progress_len())
            .field("finished", &inner.store.finished_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record_events(queue: &ThrottledQueue) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = seen.clone();
            queue.on(kind, move |e| seen.lock().unwrap().push(e.kind()));
        }
        seen
    }

    fn kinds(seen: &Arc<Mutex<Vec<EventKind>>>) -> Vec<EventKind> {
        seen.lock().unwrap().clone()
    }

    /// Let spawned ticks and timers run without moving the clock
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn instant_task(label: &'static str) -> Task {
        Task::sync(move || json!(label)).named(label)
    }

    /// Task that completes through `Done` after `ms` of (paused) time
    fn sleeping_task(ms: u64) -> Task {
        Task::new(move |done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                done.ok(json!(ms));
            });
            None
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_queue_is_stopped() {
        let queue = ThrottledQueue::new();
        assert!(queue.is_stopped());
        assert!(!queue.is_paused());
        assert_eq!(queue.len(), 0);
        assert!(queue.stats().cycles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_empty_emits_start_then_empty() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);

        queue.start(std::iter::empty());
        settle().await;

        assert_eq!(kinds(&seen), vec![EventKind::Start, EventKind::Empty]);
        assert!(queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_deferred() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);

        queue.start([instant_task("a")]);
        // Nothing ran inside the call
        assert_eq!(kinds(&seen), vec![EventKind::Start]);
        assert_eq!(queue.len(), 1);

        settle().await;
        assert_eq!(
            kinds(&seen),
            vec![EventKind::Start, EventKind::TaskStart, EventKind::TaskEnd, EventKind::Empty]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_completion_order() {
        let queue = ThrottledQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        queue.on(EventKind::TaskEnd, move |e| {
            if let QueueEvent::TaskEnd { task, .. } = e {
                sink.lock().unwrap().push(task.name().unwrap_or("?").to_string());
            }
        });

        queue.start(["a", "b", "c", "d"].map(instant_task));
        settle().await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "d"]);
        let seqs: Vec<Option<u64>> = queue.tasks_finished().iter().map(|r| r.seq()).collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_args_forwarded_verbatim() {
        let queue = ThrottledQueue::new();
        let args = Arc::new(Mutex::new(None));
        let sink = args.clone();
        queue.on(EventKind::TaskEnd, move |e| {
            if let QueueEvent::TaskEnd { args, .. } = e {
                *sink.lock().unwrap() = Some(args.clone());
            }
        });

        let task = Task::new(|done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                done.call(vec![Value::Null, json!("result-A")]);
            });
            None
        });
        queue.start([task]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(args.lock().unwrap().clone(), Some(vec![Value::Null, json!("result-A")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_and_late_handle_emit_one_task_end() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);
        let task = Task::new(|done| {
            let late = done.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                late.ok(json!("late"));
            });
            Some(json!("now"))
        });

        queue.start([task]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ends = kinds(&seen).iter().filter(|k| **k == EventKind::TaskEnd).count();
        assert_eq!(ends, 1);
        assert_eq!(queue.tasks_finished().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_respected() {
        let queue = ThrottledQueue::with_options(QueueOptions::default().with_concurrency(2));
        let peak = Arc::new(Mutex::new(0usize));
        let handle = queue.clone();
        let p = peak.clone();
        queue.on(EventKind::TaskStart, move |_| {
            let running = handle.tasks_in_progress().len();
            let mut peak = p.lock().unwrap();
            *peak = (*peak).max(running);
        });

        queue.start((0..6).map(|_| sleeping_task(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*peak.lock().unwrap(), 2);
        assert_eq!(queue.tasks_finished().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_by_start_spacing() {
        let queue = ThrottledQueue::with_options(
            QueueOptions::default()
                .with_concurrency(2)
                .with_interval_by_start(Interval::from_millis(100)),
        );
        let starts = Arc::new(Mutex::new(Vec::new()));
        let s = starts.clone();
        let origin = clock::now();
        queue.on(EventKind::TaskStart, move |_| s.lock().unwrap().push(clock::now() - origin));
        let seen = record_events(&queue);

        queue.start((0..4).map(|i| instant_task(["a", "b", "c", "d"][i])));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100), "{:?}", starts);
        }
        let kinds = kinds(&seen);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskEnd).count(), 4);
        assert_eq!(kinds.last(), Some(&EventKind::Empty));
        assert!(kinds.contains(&EventKind::WaitingStart));
        assert!(kinds.contains(&EventKind::WaitingEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_by_finished_spacing() {
        let queue =
            ThrottledQueue::with_options(QueueOptions::default().with_interval_by_finished(Interval::from_millis(80)));
        let log = Arc::new(Mutex::new(Vec::new()));
        let origin = clock::now();
        for kind in [EventKind::TaskStart, EventKind::TaskEnd] {
            let log = log.clone();
            queue.on(kind, move |e| log.lock().unwrap().push((e.kind(), clock::now() - origin)));
        }

        queue.start((0..3).map(|_| sleeping_task(10)));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let log = log.lock().unwrap().clone();
        let mut last_end = None;
        for (kind, at) in log {
            match kind {
                EventKind::TaskEnd => last_end = Some(at),
                EventKind::TaskStart => {
                    if let Some(end) = last_end {
                        assert!(at - end >= Duration::from_millis(80));
                    }
                }
                _ => {}
            }
        }
        assert_eq!(queue.tasks_finished().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_waits_for_in_progress() {
        let queue = ThrottledQueue::with_options(QueueOptions::default().with_concurrency(2));
        let seen = record_events(&queue);

        queue.start([sleeping_task(50), sleeping_task(80)]);
        settle().await;
        assert_eq!(queue.tasks_in_progress().len(), 2);

        queue.pause();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!kinds(&seen).contains(&EventKind::Paused));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let kinds = kinds(&seen);
        let paused_at = kinds.iter().position(|k| *k == EventKind::Paused).unwrap();
        let ends = kinds[..paused_at].iter().filter(|k| **k == EventKind::TaskEnd).count();
        assert_eq!(ends, 2);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskStart).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_new_dispatch_and_resume_continues() {
        let queue = ThrottledQueue::new();
        queue.push((0..3).map(|_| sleeping_task(10)));
        queue.start(std::iter::empty());
        settle().await;
        queue.pause();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.tasks_finished().len(), 1);

        queue.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.tasks_finished().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_are_idempotent() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);
        queue.push([sleeping_task(100)]);
        queue.start(std::iter::empty());
        settle().await;

        queue.pause().pause();
        queue.resume().resume();
        let kinds = kinds(&seen);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Pause).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Resume).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_when_idle_emits_paused_immediately() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        let seen = record_events(&queue);

        queue.pause();
        assert_eq!(kinds(&seen), vec![EventKind::Pause, EventKind::Paused]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_emits_stopped() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        let seen = record_events(&queue);

        queue.stop();
        assert_eq!(kinds(&seen), vec![EventKind::Stop, EventKind::Stopped]);
        queue.stop();
        assert_eq!(kinds(&seen).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_task_finish() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);
        queue.start([sleeping_task(30), sleeping_task(30)]);
        settle().await;

        queue.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let kinds = kinds(&seen);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskStart).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskEnd).count(), 1);
        assert!(!kinds.contains(&EventKind::Stopped));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_start_resets_bookkeeping_keeps_pending() {
        let queue = ThrottledQueue::new();
        queue.start([instant_task("a"), instant_task("b")]);
        settle().await;
        assert_eq!(queue.tasks_finished().len(), 2);

        queue.stop();
        queue.push([instant_task("c")]);
        assert_eq!(queue.len(), 1);
        settle().await;
        assert_eq!(queue.len(), 1);

        queue.start(std::iter::empty());
        assert!(queue.tasks_finished().is_empty());
        settle().await;
        let finished = queue.tasks_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].seq(), Some(0));
        assert_eq!(finished[0].task().name(), Some("c"));
        assert_eq!(queue.stats().cycles.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_completion_reports_without_touching_new_cycle() {
        let queue = ThrottledQueue::new();
        let stale = Arc::new(Mutex::new(Vec::new()));
        let s = stale.clone();
        queue.on(EventKind::TaskEnd, move |e| {
            if let QueueEvent::TaskEnd { record, .. } = e {
                s.lock().unwrap().push((record.cycle(), record.seq()));
            }
        });

        queue.start([sleeping_task(50)]);
        settle().await;
        queue.stop().start(std::iter::empty());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(*stale.lock().unwrap(), vec![(1, None)]);
        assert!(queue.tasks_finished().is_empty());
        assert!(queue.tasks_in_progress().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_stopped_starts() {
        let queue = ThrottledQueue::new();
        let seen = record_events(&queue);
        queue.resume();
        assert_eq!(kinds(&seen), vec![EventKind::Start, EventKind::Empty]);
        assert!(queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_paused_resumes() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        queue.pause();
        let seen = record_events(&queue);

        queue.start([instant_task("a")]);
        settle().await;
        assert_eq!(
            kinds(&seen),
            vec![EventKind::Resume, EventKind::TaskStart, EventKind::TaskEnd, EventKind::Empty]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_while_running_dispatches() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        settle().await;

        assert_eq!(queue.push([instant_task("late")]), 1);
        settle().await;
        assert_eq!(queue.tasks_finished().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshift_while_running_dispatches() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        settle().await;

        assert_eq!(queue.unshift([instant_task("head")]), 1);
        settle().await;
        let finished = queue.tasks_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].task().name(), Some("head"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_splice_insert_while_running_dispatches() {
        let queue = ThrottledQueue::new();
        queue.start(std::iter::empty());
        settle().await;

        assert!(queue.splice(0, 0, [instant_task("spliced")]).is_empty());
        settle().await;
        let finished = queue.tasks_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].task().name(), Some("spliced"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_only_splice_skips_gate() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let queue = ThrottledQueue::with_options(QueueOptions::default().with_interval_by_start(Interval::from_fn(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Duration::ZERO
            },
        )));
        queue.start([sleeping_task(1_000), instant_task("b"), instant_task("c")]);
        settle().await;
        assert_eq!(queue.tasks_in_progress().len(), 1);
        let before = checks.load(Ordering::SeqCst);

        let removed = queue.splice(0, 1, std::iter::empty());
        assert_eq!(removed[0].name(), Some("b"));
        assert_eq!(checks.load(Ordering::SeqCst), before);

        queue.splice(0, 0, [instant_task("x")]);
        assert!(checks.load(Ordering::SeqCst) > before);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_closure_may_read_queue() {
        let slot: Arc<OnceLock<ThrottledQueue>> = Arc::new(OnceLock::new());
        let reader = slot.clone();
        let queue = ThrottledQueue::with_options(QueueOptions::default().with_interval_by_start(Interval::from_fn(
            move || Duration::from_millis(reader.get().map(|q| q.len()).unwrap_or(0) as u64),
        )));
        let _ = slot.set(queue.clone());

        queue.start([instant_task("a"), instant_task("b")]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.set_options(queue.options());
        settle().await;

        assert_eq!(queue.tasks_finished().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_strand_dispatch() {
        let queue = ThrottledQueue::new();
        queue.on(EventKind::TaskStart, |_| panic!("listener failed"));
        let seen = record_events(&queue);

        queue.start([instant_task("a"), instant_task("b")]);
        settle().await;

        assert_eq!(queue.tasks_finished().len(), 2);
        assert!(queue.tasks_in_progress().is_empty());
        assert_eq!(kinds(&seen).last(), Some(&EventKind::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_reentry_keeps_event_order() {
        let queue = ThrottledQueue::new();
        let handle = queue.clone();
        queue.once(EventKind::Start, move |_| {
            handle.pause();
        });
        let seen = record_events(&queue);

        queue.start(std::iter::empty());
        assert_eq!(
            kinds(&seen),
            vec![EventKind::Start, EventKind::Empty, EventKind::Pause, EventKind::Paused]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_delivered_in_state_order_across_threads() {
        let queue = ThrottledQueue::with_options(QueueOptions::default().with_concurrency(2));
        let mut rx = queue.subscribe();
        queue.on(EventKind::TaskEnd, |e| {
            if let QueueEvent::TaskEnd { task, .. } = e {
                if task.name() == Some("a") {
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        });

        let (tx, mut parked) = tokio::sync::mpsc::unbounded_channel::<(&'static str, Done)>();
        let parking = |name: &'static str| {
            let tx = tx.clone();
            Task::new(move |done| {
                let _ = tx.send((name, done));
                None
            })
            .named(name)
        };
        queue.start([parking("a"), parking("b")]);

        let mut handles = HashMap::new();
        for _ in 0..2 {
            let (name, done) = parked.recv().await.unwrap();
            handles.insert(name, done);
        }
        let done_a = handles.remove("a").unwrap();
        let done_b = handles.remove("b").unwrap();

        let first = std::thread::spawn(move || done_a.ok(json!("a")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = std::thread::spawn(move || done_b.ok(json!("b")));

        let mut order = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let label = match &event {
                QueueEvent::TaskEnd { task, .. } => format!("task:end({})", task.name().unwrap_or("?")),
                other => other.kind().to_string(),
            };
            order.push(label);
            if matches!(event, QueueEvent::Empty) {
                break;
            }
        }
        assert!(first.join().unwrap());
        assert!(second.join().unwrap());

        assert_eq!(
            order,
            vec!["start", "task:start", "task:start", "task:end(a)", "task:end(b)", "empty"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_ops_before_start() {
        let queue = ThrottledQueue::new();
        let a = instant_task("a");
        queue.push([a.clone(), instant_task("b"), instant_task("c")]);
        queue.unshift([instant_task("z")]);

        assert_eq!(queue.index_of(&a), Some(1));
        assert_eq!(queue.shift().unwrap().name(), Some("z"));
        assert_eq!(queue.pop().unwrap().name(), Some("c"));
        let reversed: Vec<_> = queue.reverse().iter().map(|t| t.name().unwrap().to_string()).collect();
        assert_eq!(reversed, vec!["b", "a"]);

        let removed = queue.splice(0, 1, [instant_task("x"), instant_task("y")]);
        assert_eq!(removed[0].name(), Some("b"));
        assert_eq!(queue.slice(..).len(), 3);
        assert_eq!(queue.last_index_of(&a), Some(2));
        settle().await;
        // Stopped queue does not dispatch
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_reclaimed() {
        let queue = ThrottledQueue::new();
        let args = Arc::new(Mutex::new(Vec::new()));
        let sink = args.clone();
        queue.on(EventKind::TaskEnd, move |e| {
            if let QueueEvent::TaskEnd { args, .. } = e {
                sink.lock().unwrap().push(args.clone());
            }
        });

        queue.start([Task::new(|_| panic!("kaboom")), instant_task("after")]);
        settle().await;

        let args = args.lock().unwrap().clone();
        assert_eq!(args[0], vec![json!("task panicked: kaboom")]);
        assert_eq!(args.len(), 2);
        assert!(queue.tasks_in_progress().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_may_call_back_into_queue() {
        let queue = ThrottledQueue::new();
        let handle = queue.clone();
        queue.once(EventKind::Empty, move |_| {
            handle.push([instant_task("from-listener")]);
        });

        queue.start(std::iter::empty());
        settle().await;
        assert_eq!(queue.tasks_finished().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_options_rearms_gate() {
        let queue =
            ThrottledQueue::with_options(QueueOptions::default().with_interval_by_start(Interval::from_millis(10_000)));
        queue.start([instant_task("a"), instant_task("b")]);
        settle().await;
        assert_eq!(queue.tasks_finished().len(), 1);

        queue.set_options(QueueOptions::default());
        settle().await;
        assert_eq!(queue.tasks_finished().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_subscriber_sees_lifecycle() {
        let queue = ThrottledQueue::new();
        let mut rx = queue.subscribe();
        queue.start(std::iter::empty());

        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Start));
        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_cycle() {
        let queue = ThrottledQueue::new();
        queue.start([sleeping_task(40)]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.pause().resume().stop();

        let stats = queue.stats();
        assert_eq!(stats.cycles.len(), 1);
        assert_eq!(stats.totals.tasks_count, 1);
        assert_eq!(stats.totals.tasks_finished_count, 1);
        assert_eq!(stats.totals.payload_time, 40);
        assert_eq!(stats.pause_count, 1);
        assert_eq!(stats.stop_count, 1);
    }
}
