//! Error types for the queue's configuration layer
//!
//! The control and collection API never returns errors; failures of tasks
//! travel through `task:end` payloads instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading queue configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid jitter range for {field}: min-ms {min_ms} > max-ms {max_ms}")]
    InvalidJitter { field: &'static str, min_ms: u64, max_ms: u64 },
}

impl ConfigError {
    /// Check if the configuration content itself is at fault (vs. I/O)
    pub fn is_invalid_content(&self) -> bool {
        matches!(self, ConfigError::Parse(_) | ConfigError::InvalidJitter { .. })
    }
}
