//! Tasks, completion handles and the task runner
//!
//! A task finishes in one of two ways: it returns `Some(value)` from its
//! function, or it returns `None` and later calls the [`Done`] handle it was
//! given. Both paths go through one latch so exactly one completion is ever
//! delivered per dispatch.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Completion payload, forwarded verbatim in `task:end`
///
/// By convention the first element carries an error (or `null`).
pub type Args = Vec<Value>;

type TaskFn = dyn Fn(Done) -> Option<Value> + Send + Sync;

/// Unique id of one dispatch of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(pub(crate) u64);

impl DispatchId {
    /// Raw value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch-{}", self.0)
    }
}

/// A deferred unit of work
///
/// Cloning shares the underlying function; clones compare equal. Two tasks
/// built from separate `Task::new` calls never compare equal.
#[derive(Clone)]
pub struct Task {
    func: Arc<TaskFn>,
    name: Option<Arc<str>>,
}

impl Task {
    /// Completion-handle style task
    ///
    /// Return `Some(value)` to finish immediately, or `None` and call `done`
    /// later (from any thread or task).
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Done) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(f),
            name: None,
        }
    }

    /// Task that always finishes synchronously with the returned value
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::new(move |_done| Some(f()))
    }

    /// Task backed by a future
    ///
    /// The future is spawned on the current tokio runtime when the task is
    /// dispatched. `Ok(v)` completes with `[null, v]`, `Err(e)` with `[e]`.
    pub fn from_future<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self::new(move |done| {
            let fut = f();
            tokio::spawn(async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(value)) => done.ok(value),
                    Ok(Err(err)) => done.err(err),
                    Err(payload) => done.err(Value::String(panic_message(payload.as_ref()))),
                };
            });
            None
        })
    }

    /// Attach a display name (used in logs and the demo timeline)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(Arc::from(name.into()));
        self
    }

    /// Display name, if one was attached
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Identity comparison
    pub fn same(&self, other: &Task) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.func), Arc::as_ptr(&other.func))
    }

    fn invoke(&self, done: Done) -> Option<Value> {
        (self.func)(done)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("ptr", &Arc::as_ptr(&self.func).cast::<()>())
            .finish()
    }
}

/// Scheduler-owned metadata for one dispatch
///
/// Handed out by value; the scheduler's own copy cannot be reached through it.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub(crate) dispatch_id: DispatchId,
    pub(crate) cycle: u64,
    pub(crate) seq: Option<u64>,
    pub(crate) started_at: Instant,
    pub(crate) finished_at: Option<Instant>,
    pub(crate) task: Task,
}

impl TaskRecord {
    pub(crate) fn started(dispatch_id: DispatchId, cycle: u64, task: Task, started_at: Instant) -> Self {
        Self {
            dispatch_id,
            cycle,
            seq: None,
            started_at,
            finished_at: None,
            task,
        }
    }

    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    /// Start/stop cycle this dispatch belongs to
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Completion order within the cycle; `None` until finished
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Time from dispatch to completion
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished_at.map(|f| f.saturating_duration_since(self.started_at))
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// Identifies the dispatch a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionKey {
    pub dispatch_id: DispatchId,
    pub cycle: u64,
}

/// Receiver of completions; implemented by the queue
pub(crate) trait CompletionSink: Send + Sync {
    fn complete(&self, key: CompletionKey, args: Args);
}

struct Latch {
    fired: AtomicBool,
    key: CompletionKey,
    sink: Weak<dyn CompletionSink>,
}

/// Completion handle passed to every task invocation
///
/// Only the first signal per dispatch is delivered, whether it comes from
/// this handle or from the task's return value. Later calls are ignored.
#[derive(Clone)]
pub struct Done {
    latch: Arc<Latch>,
}

impl Done {
    pub(crate) fn new(key: CompletionKey, sink: Weak<dyn CompletionSink>) -> Self {
        Self {
            latch: Arc::new(Latch {
                fired: AtomicBool::new(false),
                key,
                sink,
            }),
        }
    }

    /// Signal completion with arbitrary arguments
    ///
    /// Returns `true` if this call delivered the completion.
    pub fn call(&self, args: Args) -> bool {
        if self.latch.fired.swap(true, Ordering::AcqRel) {
            trace!(dispatch_id = %self.latch.key.dispatch_id, "Done::call: already completed, ignoring");
            return false;
        }
        match self.latch.sink.upgrade() {
            Some(sink) => sink.complete(self.latch.key, args),
            None => debug!(dispatch_id = %self.latch.key.dispatch_id, "Done::call: queue dropped"),
        }
        true
    }

    /// Success: `[null, value]`
    pub fn ok(&self, value: Value) -> bool {
        self.call(vec![Value::Null, value])
    }

    /// Failure: `[error]`
    pub fn err(&self, error: Value) -> bool {
        self.call(vec![error])
    }

    /// Completion without payload
    pub fn finish(&self) -> bool {
        self.call(Vec::new())
    }

    /// Whether a completion has already been delivered for this dispatch
    pub fn is_done(&self) -> bool {
        self.latch.fired.load(Ordering::Acquire)
    }

    pub fn dispatch_id(&self) -> DispatchId {
        self.latch.key.dispatch_id
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("dispatch_id", &self.latch.key.dispatch_id)
            .field("fired", &self.is_done())
            .finish()
    }
}

/// How the task's own call came back
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Returned a value; completes now with it as the sole argument
    Completed(Args),
    /// Returned nothing; completion arrives through `Done`
    Pending,
}

/// Run one task invocation and normalize its completion
///
/// On panic the dispatch is completed with `["task panicked: ..."]` and the
/// payload is handed back so the caller can resume unwinding.
pub(crate) fn run(task: &Task, done: Done) -> Result<Completion, Box<dyn Any + Send>> {
    let latch = done.clone();
    match catch_unwind(AssertUnwindSafe(|| task.invoke(done))) {
        Ok(Some(value)) => {
            let args = vec![value];
            latch.call(args.clone());
            Ok(Completion::Completed(args))
        }
        Ok(None) => Ok(Completion::Pending),
        Err(payload) => {
            latch.err(Value::String(panic_message(payload.as_ref())));
            Err(payload)
        }
    }
}

/// Render a panic payload as `task panicked: <message>`
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    format!("task panicked: {}", panic_text(payload))
}

/// Message carried by a panic payload
pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
