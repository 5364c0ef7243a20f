//! Time sources for the queue
//!
//! Scheduling math uses tokio's monotonic `Instant` so that the paused test
//! clock drives every interval check. Stats carry wall-clock timestamps in
//! milliseconds since the Unix epoch.

use tokio::time::Instant;

/// Monotonic "now" used by the admission gate and task records
pub fn now() -> Instant {
    Instant::now()
}

/// Get current wall-clock timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
