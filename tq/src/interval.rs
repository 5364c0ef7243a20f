//! Interval resolution for dispatch throttling
//!
//! An interval is either a fixed duration or a source that is asked again on
//! every gate check, which is how adaptive and jittered throttling is built.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Anything that can produce the current minimum spacing between dispatches
pub trait IntervalSource: Send + Sync {
    /// Resolve the interval for this check
    fn resolve(&self) -> Duration;
}

/// Constant interval
#[derive(Debug, Clone, Copy)]
struct Fixed(Duration);

impl IntervalSource for Fixed {
    fn resolve(&self) -> Duration {
        self.0
    }
}

/// Interval computed by a caller-supplied closure
struct FromFn<F>(F);

impl<F> IntervalSource for FromFn<F>
where
    F: Fn() -> Duration + Send + Sync,
{
    fn resolve(&self) -> Duration {
        (self.0)()
    }
}

/// Uniformly random interval in `[min, max]`
#[derive(Debug, Clone, Copy)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    /// Create a jitter source; bounds are swapped if given in the wrong order
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max { Self { min, max } } else { Self { min: max, max: min } }
    }
}

impl IntervalSource for Jitter {
    fn resolve(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

/// Shared handle to an interval source
///
/// Cloning is cheap; every clone resolves through the same source.
#[derive(Clone)]
pub struct Interval {
    source: Arc<dyn IntervalSource>,
    label: &'static str,
}

impl Interval {
    /// No spacing at all
    pub fn zero() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Fixed spacing
    pub fn fixed(duration: Duration) -> Self {
        Self {
            source: Arc::new(Fixed(duration)),
            label: "fixed",
        }
    }

    /// Fixed spacing in milliseconds
    pub fn from_millis(ms: u64) -> Self {
        Self::fixed(Duration::from_millis(ms))
    }

    /// Spacing recomputed by `f` on every check
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(FromFn(f)),
            label: "fn",
        }
    }

    /// Uniformly jittered spacing between `min` and `max`
    pub fn jitter(min: Duration, max: Duration) -> Self {
        Self {
            source: Arc::new(Jitter::new(min, max)),
            label: "jitter",
        }
    }

    /// Wrap any custom source
    pub fn from_source(source: Arc<dyn IntervalSource>) -> Self {
        Self { source, label: "custom" }
    }

    /// Resolve the current value
    pub fn resolve(&self) -> Duration {
        self.source.resolve()
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::fixed(duration)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interval").field("kind", &self.label).finish()
    }
}
