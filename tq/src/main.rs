//! tq - throttled queue demo
//!
//! Pushes synthetic tasks through a `ThrottledQueue` and prints what happens.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use throttled_queue::cli::{Cli, Command, OutputFormat, get_log_path};
use throttled_queue::config::Config;
use throttled_queue::{EventKind, Interval, QueueEvent, QueueStats, Task, ThrottledQueue, clock};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to the log file so the timeline on stdout stays clean
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

/// Command-line overrides for `tq run`
#[derive(Default)]
struct RunArgs {
    tasks: Option<usize>,
    task_ms: Option<u64>,
    concurrency: Option<f64>,
    interval_by_start: Option<u64>,
    interval_by_finished: Option<u64>,
    pause_after: Option<usize>,
    pause_ms: Option<u64>,
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        concurrency = config.queue.concurrency,
        tasks = config.demo.tasks,
        "tq loaded config"
    );

    match cli.command {
        Some(Command::Run {
            tasks,
            task_ms,
            concurrency,
            interval_by_start,
            interval_by_finished,
            pause_after,
            pause_ms,
            format,
        }) => {
            let args = RunArgs {
                tasks,
                task_ms,
                concurrency,
                interval_by_start,
                interval_by_finished,
                pause_after,
                pause_ms,
                format,
            };
            cmd_run(&config, args).await
        }
        Some(Command::Config) => cmd_config(&config),
        None => cmd_run(&config, RunArgs::default()).await,
    }
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}

/// Run a synthetic workload and report the timeline and stats
async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    let mut options = config.queue.to_options();
    if let Some(raw) = args.concurrency {
        options = options.with_raw_concurrency(raw);
    }
    if let Some(ms) = args.interval_by_start {
        options = options.with_interval_by_start(Interval::from_millis(ms));
    }
    if let Some(ms) = args.interval_by_finished {
        options = options.with_interval_by_finished(Interval::from_millis(ms));
    }
    let count = args.tasks.unwrap_or(config.demo.tasks);
    let task_ms = args.task_ms.unwrap_or(config.demo.task_ms);
    debug!(?options, count, task_ms, "cmd_run: called");

    let queue = ThrottledQueue::with_options(options);
    let origin = clock::now();
    let format = args.format;

    for kind in EventKind::ALL {
        queue.on(kind, move |event| print_event(event, origin, format));
    }

    if let (Some(after), Some(pause_ms)) = (args.pause_after, args.pause_ms) {
        let started = Arc::new(AtomicUsize::new(0));
        let handle = queue.clone();
        queue.on(EventKind::TaskStart, move |_| {
            if started.fetch_add(1, Ordering::SeqCst) + 1 == after {
                handle.pause();
                let handle = handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                    handle.resume();
                });
            }
        });
    }

    let mut rx = queue.subscribe();
    let tasks = (0..count).map(|i| synthetic_task(i, task_ms));
    queue.start(tasks);

    loop {
        match rx.recv().await {
            Ok(QueueEvent::Empty) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "cmd_run: event receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    queue.stop();

    print_stats(&queue.stats(), format)
}

/// Task that sleeps `task_ms` and completes through its handle
fn synthetic_task(index: usize, task_ms: u64) -> Task {
    Task::new(move |done| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(task_ms)).await;
            done.ok(json!(index));
        });
        None
    })
    .named(format!("task-{}", index))
}

fn print_event(event: &QueueEvent, origin: tokio::time::Instant, format: OutputFormat) {
    let at = (clock::now() - origin).as_millis();
    if format == OutputFormat::Json {
        let mut line = event.to_json();
        line["t-ms"] = json!(at as u64);
        println!("{}", line);
        return;
    }

    let stamp = format!("{:>6}ms", at).dimmed();
    match event {
        QueueEvent::TaskStart { dispatch_id, task } => {
            println!("{} {} {} ({})", stamp, "start".green(), task.name().unwrap_or("?"), dispatch_id);
        }
        QueueEvent::TaskEnd { args, record, task } => {
            let elapsed = record.elapsed().map(|d| d.as_millis()).unwrap_or(0);
            let failed = args.first().is_some_and(|first| !first.is_null());
            let label = if failed { "fail ".red() } else { "end  ".blue() };
            println!("{} {} {} after {}ms", stamp, label, task.name().unwrap_or("?"), elapsed);
        }
        QueueEvent::WaitingStart { delay } => {
            println!("{} {} {}ms", stamp, "wait".yellow(), delay.as_millis());
        }
        QueueEvent::WaitingEnd { .. } => {}
        other => println!("{} {}", stamp, other.kind().as_str().bright_cyan().bold()),
    }
}

fn print_stats(stats: &QueueStats, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    let totals = &stats.totals;
    println!();
    println!("{}", "Queue stats".bold());
    println!("-----------");
    println!("Cycles:         {}", stats.cycles.len());
    println!("Tasks started:  {}", totals.tasks_count);
    println!("Tasks finished: {}", totals.tasks_finished_count);
    println!("Busy:           {}ms", totals.payload_time);
    println!("Idle:           {}ms", totals.idle_time);
    println!("Paused:         {}ms ({} pauses)", totals.paused_time, stats.pause_count);
    println!("Total:          {}ms", totals.all_time);
    Ok(())
}
