//! Per-cycle queue statistics
//!
//! Purely observational: the queue feeds lifecycle and task transitions in,
//! nothing here is read back by the scheduler. Durations are milliseconds of
//! the monotonic clock; `started_at_ms` / `stopped_at_ms` are wall-clock.

use serde::Serialize;
use tokio::time::Instant;

use crate::clock;
use crate::queue::State;

/// Accumulated figures for one start/stop cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CycleStats {
    pub started_at_ms: i64,
    pub stopped_at_ms: Option<i64>,
    /// Time spent paused
    pub paused_time: u64,
    /// Time between this cycle's stop and the next start
    pub stopped_time: u64,
    /// Time with at least one task in progress
    pub payload_time: u64,
    /// Time running with nothing in progress
    pub idle_time: u64,
    /// Start to stop, or to now while the cycle is open
    pub all_time: u64,
    pub tasks_count: u64,
    pub tasks_finished_count: u64,
}

impl CycleStats {
    fn add(&mut self, other: &CycleStats) {
        self.paused_time += other.paused_time;
        self.stopped_time += other.stopped_time;
        self.payload_time += other.payload_time;
        self.idle_time += other.idle_time;
        self.all_time += other.all_time;
        self.tasks_count += other.tasks_count;
        self.tasks_finished_count += other.tasks_finished_count;
    }
}

/// Aggregate over all recorded cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueStats {
    pub cycles: Vec<CycleStats>,
    /// Sums across cycles; `started_at_ms` is the first start, `stopped_at_ms` the last stop
    pub totals: CycleStats,
    pub pause_count: u64,
    pub stop_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Cycle {
    started_at: Instant,
    stopped_at: Option<Instant>,
}

/// Interval trackers; each is open while its condition holds
#[derive(Debug, Default, Clone, Copy)]
struct Open {
    paused: Option<Instant>,
    stopped: Option<Instant>,
    payload: Option<Instant>,
    idle: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct StatsCollector {
    epoch: Instant,
    epoch_ms: i64,
    cycles: Vec<(Cycle, CycleStats)>,
    open: Open,
    pause_count: u64,
    stop_count: u64,
}

fn ms_between(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}

impl StatsCollector {
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            epoch_ms: clock::now_ms(),
            cycles: Vec::new(),
            open: Open::default(),
            pause_count: 0,
            stop_count: 0,
        }
    }

    fn wall_ms(&self, at: Instant) -> i64 {
        self.epoch_ms + ms_between(self.epoch, at) as i64
    }

    /// Close every open interval into the current cycle
    fn close(&mut self, now: Instant) {
        let open = std::mem::take(&mut self.open);
        let Some((_, stats)) = self.cycles.last_mut() else {
            return;
        };
        if let Some(since) = open.paused {
            stats.paused_time += ms_between(since, now);
        }
        if let Some(since) = open.stopped {
            stats.stopped_time += ms_between(since, now);
        }
        if let Some(since) = open.payload {
            stats.payload_time += ms_between(since, now);
        }
        if let Some(since) = open.idle {
            stats.idle_time += ms_between(since, now);
        }
    }

    /// Re-open intervals for the state the queue is now in
    fn open(&mut self, now: Instant, state: State, in_progress: usize) {
        if self.cycles.is_empty() {
            return;
        }
        self.open = Open {
            paused: (state == State::Paused).then_some(now),
            stopped: (state == State::Stopped).then_some(now),
            payload: (in_progress > 0).then_some(now),
            idle: (state == State::Running && in_progress == 0).then_some(now),
        };
    }

    fn transition(&mut self, now: Instant, state: State, in_progress: usize) {
        self.close(now);
        self.open(now, state, in_progress);
    }

    pub fn on_start(&mut self, now: Instant, in_progress: usize) {
        self.close(now);
        let cycle = Cycle {
            started_at: now,
            stopped_at: None,
        };
        let stats = CycleStats {
            started_at_ms: self.wall_ms(now),
            ..CycleStats::default()
        };
        self.cycles.push((cycle, stats));
        self.open(now, State::Running, in_progress);
    }

    pub fn on_pause(&mut self, now: Instant, in_progress: usize) {
        self.pause_count += 1;
        self.transition(now, State::Paused, in_progress);
    }

    pub fn on_resume(&mut self, now: Instant, in_progress: usize) {
        self.transition(now, State::Running, in_progress);
    }

    pub fn on_stop(&mut self, now: Instant, in_progress: usize) {
        self.stop_count += 1;
        self.close(now);
        let wall = self.wall_ms(now);
        if let Some((cycle, stats)) = self.cycles.last_mut() {
            cycle.stopped_at = Some(now);
            stats.stopped_at_ms = Some(wall);
        }
        self.open(now, State::Stopped, in_progress);
    }

    /// A task moved into in-progress
    pub fn on_dispatch(&mut self, now: Instant, state: State, in_progress: usize) {
        if let Some((_, stats)) = self.cycles.last_mut() {
            stats.tasks_count += 1;
        }
        self.transition(now, state, in_progress);
    }

    /// A task left in-progress; `current` is false for earlier-cycle completions
    pub fn on_finish(&mut self, now: Instant, state: State, in_progress: usize, current: bool) {
        if current {
            if let Some((_, stats)) = self.cycles.last_mut() {
                stats.tasks_finished_count += 1;
            }
        }
        self.transition(now, state, in_progress);
    }

    /// Aggregate view with open intervals closed against `now`
    pub fn snapshot(&self, now: Instant) -> QueueStats {
        let last = self.cycles.len().saturating_sub(1);
        let cycles: Vec<CycleStats> = self
            .cycles
            .iter()
            .enumerate()
            .map(|(i, (cycle, stats))| {
                let mut stats = stats.clone();
                if i == last {
                    let open = self.open;
                    stats.paused_time += open.paused.map_or(0, |s| ms_between(s, now));
                    stats.stopped_time += open.stopped.map_or(0, |s| ms_between(s, now));
                    stats.payload_time += open.payload.map_or(0, |s| ms_between(s, now));
                    stats.idle_time += open.idle.map_or(0, |s| ms_between(s, now));
                }
                stats.all_time = ms_between(cycle.started_at, cycle.stopped_at.unwrap_or(now));
                stats
            })
            .collect();

        let mut totals = CycleStats {
            started_at_ms: cycles.first().map_or(0, |c| c.started_at_ms),
            stopped_at_ms: cycles.iter().rev().find_map(|c| c.stopped_at_ms),
            ..CycleStats::default()
        };
        for stats in &cycles {
            totals.add(stats);
        }

        QueueStats {
            cycles,
            totals,
            pause_count: self.pause_count,
            stop_count: self.stop_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_no_cycles_before_start() {
        let base = Instant::now();
        let stats = StatsCollector::new(base).snapshot(at(base, 100));
        assert!(stats.cycles.is_empty());
        assert_eq!(stats.totals.all_time, 0);
    }

    #[test]
    fn test_payload_and_idle_split() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        c.on_dispatch(at(base, 10), State::Running, 1);
        c.on_finish(at(base, 40), State::Running, 0, true);
        c.on_stop(at(base, 50), 0);

        let stats = c.snapshot(at(base, 50));
        let cycle = &stats.cycles[0];
        assert_eq!(cycle.payload_time, 30);
        assert_eq!(cycle.idle_time, 20);
        assert_eq!(cycle.all_time, 50);
        assert_eq!(cycle.tasks_count, 1);
        assert_eq!(cycle.tasks_finished_count, 1);
        assert!(cycle.stopped_at_ms.is_some());
    }

    #[test]
    fn test_paused_time_and_count() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        c.on_pause(at(base, 100), 0);
        c.on_resume(at(base, 175), 0);

        let stats = c.snapshot(at(base, 200));
        assert_eq!(stats.pause_count, 1);
        assert_eq!(stats.cycles[0].paused_time, 75);
        assert_eq!(stats.cycles[0].idle_time, 125);
        // Open cycle runs to "now"
        assert_eq!(stats.cycles[0].all_time, 200);
    }

    #[test]
    fn test_stopped_time_attributed_to_stopped_cycle() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        c.on_stop(at(base, 100), 0);
        c.on_start(at(base, 160), 0);
        c.on_stop(at(base, 200), 0);

        let stats = c.snapshot(at(base, 230));
        assert_eq!(stats.cycles.len(), 2);
        assert_eq!(stats.cycles[0].stopped_time, 60);
        assert_eq!(stats.cycles[1].stopped_time, 30);
        assert_eq!(stats.totals.stopped_time, 90);
        assert_eq!(stats.totals.all_time, 140);
        assert_eq!(stats.stop_count, 2);
        assert_eq!(stats.totals.started_at_ms, stats.cycles[0].started_at_ms);
        assert_eq!(stats.totals.stopped_at_ms, stats.cycles[1].stopped_at_ms);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        c.on_dispatch(base, State::Running, 1);

        assert_eq!(c.snapshot(at(base, 30)).cycles[0].payload_time, 30);
        assert_eq!(c.snapshot(at(base, 60)).cycles[0].payload_time, 60);
    }

    #[test]
    fn test_stale_finish_not_counted() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        c.on_finish(at(base, 5), State::Running, 0, false);
        assert_eq!(c.snapshot(at(base, 5)).cycles[0].tasks_finished_count, 0);
    }

    #[test]
    fn test_serializes_kebab_case() {
        let base = Instant::now();
        let mut c = StatsCollector::new(base);
        c.on_start(base, 0);
        let json = serde_json::to_value(c.snapshot(at(base, 10))).unwrap();
        assert!(json["totals"]["payload-time"].is_u64());
        assert_eq!(json["pause-count"], 0);
    }
}
