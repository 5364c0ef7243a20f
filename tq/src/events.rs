//! Queue events
//!
//! Two ways to observe a queue:
//! - synchronous listeners, registered per [`EventKind`] and called in
//!   registration order at the point the event happens
//! - a tokio broadcast channel for async consumers ([`EventHub::subscribe`])
//!
//! Every event goes to both. Listeners are never called while the queue's
//! state lock is held, so they may call back into the queue. A panicking
//! listener is logged and skipped; the remaining listeners still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

use crate::task::{self, Args, DispatchId, Task, TaskRecord};

/// Default broadcast capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event names, matching the `kind:action` strings used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "task:start")]
    TaskStart,
    #[serde(rename = "task:end")]
    TaskEnd,
    #[serde(rename = "waiting:start")]
    WaitingStart,
    #[serde(rename = "waiting:end")]
    WaitingEnd,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "stopped")]
    Stopped,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::Start,
        EventKind::Pause,
        EventKind::Resume,
        EventKind::Stop,
        EventKind::TaskStart,
        EventKind::TaskEnd,
        EventKind::WaitingStart,
        EventKind::WaitingEnd,
        EventKind::Paused,
        EventKind::Empty,
        EventKind::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::TaskStart => "task:start",
            Self::TaskEnd => "task:end",
            Self::WaitingStart => "waiting:start",
            Self::WaitingEnd => "waiting:end",
            Self::Paused => "paused",
            Self::Empty => "empty",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown event: {}", s))
    }
}

/// Something observable that happened in the queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Start,
    Pause,
    Resume,
    Stop,
    /// A task is about to run
    TaskStart { dispatch_id: DispatchId, task: Task },
    /// A task completed; `args` are its completion arguments, verbatim
    TaskEnd { args: Args, record: TaskRecord, task: Task },
    /// A throttling wait was armed
    WaitingStart { delay: Duration },
    /// A throttling wait elapsed
    WaitingEnd { delay: Duration },
    /// Everything in progress drained while paused
    Paused,
    /// Pending drained
    Empty,
    /// Pending drained while stopped
    Stopped,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::Pause => EventKind::Pause,
            Self::Resume => EventKind::Resume,
            Self::Stop => EventKind::Stop,
            Self::TaskStart { .. } => EventKind::TaskStart,
            Self::TaskEnd { .. } => EventKind::TaskEnd,
            Self::WaitingStart { .. } => EventKind::WaitingStart,
            Self::WaitingEnd { .. } => EventKind::WaitingEnd,
            Self::Paused => EventKind::Paused,
            Self::Empty => EventKind::Empty,
            Self::Stopped => EventKind::Stopped,
        }
    }

    /// JSON summary for logs and the demo's `--format json`
    pub fn to_json(&self) -> Value {
        match self {
            Self::TaskStart { dispatch_id, task } => json!({
                "event": self.kind().as_str(),
                "dispatch-id": dispatch_id.get(),
                "task": task.name(),
            }),
            Self::TaskEnd { args, record, task } => json!({
                "event": self.kind().as_str(),
                "dispatch-id": record.dispatch_id().get(),
                "seq": record.seq(),
                "elapsed-ms": record.elapsed().map(|d| d.as_millis() as u64),
                "task": task.name(),
                "args": args,
            }),
            Self::WaitingStart { delay } | Self::WaitingEnd { delay } => json!({
                "event": self.kind().as_str(),
                "delay-ms": delay.as_millis() as u64,
            }),
            _ => json!({ "event": self.kind().as_str() }),
        }
    }
}

/// Synchronous event handler
pub type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Handle returned by `on`/`once`, used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

/// Listener registry plus broadcast fan-out
pub struct EventHub {
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<QueueEvent>,
}

impl EventHub {
    /// Create a hub with the given broadcast capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventHub::new: called");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    fn register(&self, kind: EventKind, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(kind)
            .or_default()
            .push(Registration { id, listener, once });
        debug!(%kind, ?id, once, "EventHub::register");
        id
    }

    /// Add a listener for `kind`
    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(f), false)
    }

    /// Add a listener that is removed after its first call
    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(f), true)
    }

    /// Remove a listener; returns whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for registrations in listeners.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                debug!(?id, "EventHub::off: removed");
                return true;
            }
        }
        false
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        debug!("EventHub::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Deliver an event to listeners, then to broadcast subscribers
    pub fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        let handlers: Vec<Listener> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            match listeners.get_mut(&kind) {
                Some(registrations) => {
                    let handlers = registrations.iter().map(|r| r.listener.clone()).collect();
                    registrations.retain(|r| !r.once);
                    handlers
                }
                None => Vec::new(),
            }
        };
        trace!(%kind, listeners = handlers.len(), "EventHub::emit");

        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(%kind, panic = %task::panic_text(payload.as_ref()), "EventHub::emit: listener panicked");
            }
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
