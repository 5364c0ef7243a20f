//! Queue configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::interval::Interval;

/// Concurrency used when none is given or the given value is unusable
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Turn an untrusted numeric concurrency into a usable limit
///
/// Exactly `0` means unbounded. Negative, NaN, infinite and fractional values
/// below 1 fall back to [`DEFAULT_CONCURRENCY`]. Larger fractions are floored.
pub fn sanitize_concurrency(raw: f64) -> usize {
    if raw == 0.0 {
        return 0;
    }
    if !raw.is_finite() || raw < 1.0 {
        debug!(raw, "sanitize_concurrency: invalid value, using default");
        return DEFAULT_CONCURRENCY;
    }
    raw.floor() as usize
}

/// Runtime options for a [`ThrottledQueue`](crate::ThrottledQueue)
///
/// Copied into the queue by `ThrottledQueue::new` / `set_options`; the gate
/// only ever reads it.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Hard cap on in-progress tasks; `0` is unbounded
    pub concurrency: usize,

    /// Minimum spacing between two consecutive dispatch starts
    pub interval_by_start: Interval,

    /// Minimum spacing between the last completion and the next dispatch
    pub interval_by_finished: Interval,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            interval_by_start: Interval::zero(),
            interval_by_finished: Interval::zero(),
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set concurrency from an untrusted number (see [`sanitize_concurrency`])
    pub fn with_raw_concurrency(mut self, raw: f64) -> Self {
        self.concurrency = sanitize_concurrency(raw);
        self
    }

    pub fn with_interval_by_start(mut self, interval: impl Into<Interval>) -> Self {
        self.interval_by_start = interval.into();
        self
    }

    pub fn with_interval_by_finished(mut self, interval: impl Into<Interval>) -> Self {
        self.interval_by_finished = interval.into();
        self
    }

    /// Whether any concurrency cap applies
    pub fn is_bounded(&self) -> bool {
        self.concurrency > 0
    }
}

/// Interval as written in a config file
///
/// Either a plain number of milliseconds or a jitter range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalSpec {
    Millis(u64),
    Jitter {
        #[serde(rename = "min-ms")]
        min_ms: u64,
        #[serde(rename = "max-ms")]
        max_ms: u64,
    },
}

impl Default for IntervalSpec {
    fn default() -> Self {
        Self::Millis(0)
    }
}

impl IntervalSpec {
    fn validate(&self, field: &'static str) -> std::result::Result<(), ConfigError> {
        match *self {
            Self::Jitter { min_ms, max_ms } if min_ms > max_ms => {
                Err(ConfigError::InvalidJitter { field, min_ms, max_ms })
            }
            _ => Ok(()),
        }
    }

    /// Build the runtime interval source
    pub fn to_interval(&self) -> Interval {
        match *self {
            Self::Millis(ms) => Interval::from_millis(ms),
            Self::Jitter { min_ms, max_ms } => Interval::jitter(
                std::time::Duration::from_millis(min_ms),
                std::time::Duration::from_millis(max_ms),
            ),
        }
    }
}

fn lenient_concurrency<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    let concurrency = match &value {
        serde_yaml::Value::Number(n) => n.as_f64().map(sanitize_concurrency).unwrap_or(DEFAULT_CONCURRENCY),
        serde_yaml::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(sanitize_concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY),
        _ => DEFAULT_CONCURRENCY,
    };
    if !matches!(value, serde_yaml::Value::Number(_)) {
        warn!(?value, concurrency, "Non-numeric concurrency in config, using fallback");
    }
    Ok(concurrency)
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// Queue section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum in-progress tasks (0 = unbounded)
    #[serde(deserialize_with = "lenient_concurrency", default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum spacing between dispatch starts
    #[serde(rename = "interval-by-start")]
    pub interval_by_start: IntervalSpec,

    /// Minimum spacing between the last completion and the next dispatch
    #[serde(rename = "interval-by-finished")]
    pub interval_by_finished: IntervalSpec,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            interval_by_start: IntervalSpec::default(),
            interval_by_finished: IntervalSpec::default(),
        }
    }
}

impl QueueConfig {
    /// Check ranges that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.interval_by_start.validate("interval-by-start")?;
        self.interval_by_finished.validate("interval-by-finished")?;
        Ok(())
    }

    /// Runtime options for this section
    pub fn to_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency: self.concurrency,
            interval_by_start: self.interval_by_start.to_interval(),
            interval_by_finished: self.interval_by_finished.to_interval(),
        }
    }
}

/// Synthetic workload settings for the `tq run` demo
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of tasks to push
    pub tasks: usize,

    /// How long each task takes
    #[serde(rename = "task-ms")]
    pub task_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { tasks: 10, task_ms: 50 }
    }
}

/// Main tq configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue limits
    pub queue: QueueConfig,

    /// Demo workload
    pub demo: DemoConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .tq.yml
        let local_config = PathBuf::from(".tq.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/tq/tq.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tq").join("tq.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load and validate a single file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(&content)?;

        info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.queue.validate()?;
        Ok(config)
    }
}
