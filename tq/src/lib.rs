//! throttled-queue - throttled concurrent task queue
//!
//! A FIFO queue of deferred tasks that dispatches under three constraints:
//! a cap on tasks in progress, a minimum spacing between dispatch starts, and
//! a minimum spacing after the latest completion. Tasks finish either by
//! returning a value or by calling their completion handle, and the queue
//! reports everything through events.
//!
//! # Modules
//!
//! - [`queue`] - Lifecycle controller and the public [`ThrottledQueue`] handle
//! - [`gate`] - Admission decisions
//! - [`task`] - Tasks, completion handles and dispatch records
//! - [`interval`] - Fixed, computed and jittered intervals
//! - [`events`] - Event types, listener registry and broadcast
//! - [`stats`] - Per-cycle statistics
//! - [`config`] - Queue options and the YAML config file
//! - [`cli`] - Command-line interface for the `tq` demo

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod interval;
pub mod queue;
pub mod stats;
mod store;
pub mod task;

// Re-export commonly used types
pub use config::{Config, DEFAULT_CONCURRENCY, IntervalSpec, QueueConfig, QueueOptions, sanitize_concurrency};
pub use error::ConfigError;
pub use events::{EventHub, EventKind, Listener, ListenerId, QueueEvent};
pub use gate::{Decision, GateView, IdleReason, Limits, SAFETY_MARGIN};
pub use interval::{Interval, IntervalSource, Jitter};
pub use queue::{State, ThrottledQueue};
pub use stats::{CycleStats, QueueStats};
pub use task::{Args, Completion, DispatchId, Done, Task, TaskRecord};
