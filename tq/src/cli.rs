//! CLI command definitions for the `tq` demo binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// tq - throttled concurrent task queue demo
#[derive(Parser)]
#[command(
    name = "tq",
    about = "Run synthetic workloads through a throttled concurrent queue",
    version,
    after_help = "Logs are written to: ~/.local/share/tq/logs/tq.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Push synthetic tasks through the queue and print a timeline
    Run {
        /// Number of tasks (overrides config)
        #[arg(short, long)]
        tasks: Option<usize>,

        /// Duration of each task in milliseconds (overrides config)
        #[arg(long)]
        task_ms: Option<u64>,

        /// Maximum in-progress tasks; 0 is unbounded (overrides config)
        #[arg(long)]
        concurrency: Option<f64>,

        /// Minimum milliseconds between dispatch starts (overrides config)
        #[arg(long, value_name = "MS")]
        interval_by_start: Option<u64>,

        /// Minimum milliseconds between a completion and the next start (overrides config)
        #[arg(long, value_name = "MS")]
        interval_by_finished: Option<u64>,

        /// Pause after this many tasks have started
        #[arg(long, value_name = "N", requires = "pause_ms")]
        pause_after: Option<usize>,

        /// How long to stay paused
        #[arg(long, value_name = "MS")]
        pause_ms: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration as YAML
    Config,
}

/// Output format for the run timeline and stats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the path to the log file
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tq")
        .join("logs")
        .join("tq.log");
    debug!(?path, "get_log_path: returning path");
    path
}
