//! Queue store for the scheduler
//!
//! Holds the three disjoint task containers: pending (ordered, dispatch
//! order), in-progress (keyed by dispatch id) and finished (completion
//! order). Only the queue's own operations and the completion path touch them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Bound, RangeBounds};

use tokio::time::Instant;

use crate::task::{CompletionKey, DispatchId, Task, TaskRecord};

/// Result of moving a dispatch out of in-progress
#[derive(Debug)]
pub(crate) enum Finish {
    /// Completed in the current cycle; the record now has its sequence index
    Current(TaskRecord),
    /// Dispatched in an earlier cycle whose bookkeeping was reset; `seq` stays `None`
    Stale(TaskRecord),
    /// No such dispatch is running
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct QueueStore {
    pending: VecDeque<Task>,
    in_progress: BTreeMap<DispatchId, TaskRecord>,
    finished: Vec<TaskRecord>,
    stale: HashMap<DispatchId, TaskRecord>,
    next_dispatch: u64,
    next_seq: u64,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Append to the tail; returns the new pending length
    pub fn push(&mut self, tasks: impl IntoIterator<Item = Task>) -> usize {
        self.pending.extend(tasks);
        self.pending.len()
    }

    /// Insert at the head, keeping the given order; returns the new pending length
    pub fn unshift(&mut self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        for task in tasks.into_iter().rev() {
            self.pending.push_front(task);
        }
        self.pending.len()
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.pending.pop_back()
    }

    pub fn shift(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    pub fn reverse(&mut self) {
        self.pending.make_contiguous().reverse();
    }

    /// Copy of the pending range, clamped to the pending length
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Vec<Task> {
        let (start, end) = self.clamp(range);
        self.pending.range(start..end).cloned().collect()
    }

    /// Remove `delete_count` tasks at `start` and insert `tasks` there
    ///
    /// Both `start` and `delete_count` are clamped. Returns the removed tasks.
    pub fn splice(&mut self, start: usize, delete_count: usize, tasks: impl IntoIterator<Item = Task>) -> Vec<Task> {
        let start = start.min(self.pending.len());
        let end = start.saturating_add(delete_count).min(self.pending.len());
        let removed: Vec<Task> = self.pending.drain(start..end).collect();
        for (offset, task) in tasks.into_iter().enumerate() {
            self.pending.insert(start + offset, task);
        }
        removed
    }

    pub fn index_of(&self, task: &Task) -> Option<usize> {
        self.pending.iter().position(|t| t.same(task))
    }

    pub fn last_index_of(&self, task: &Task) -> Option<usize> {
        self.pending.iter().rposition(|t| t.same(task))
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.pending.iter().cloned().collect()
    }

    /// In-progress records in dispatch order
    pub fn in_progress(&self) -> Vec<TaskRecord> {
        self.in_progress.values().cloned().collect()
    }

    /// Finished records in completion order
    pub fn finished(&self) -> Vec<TaskRecord> {
        self.finished.clone()
    }

    pub fn clear_finished(&mut self) -> Vec<TaskRecord> {
        std::mem::take(&mut self.finished)
    }

    /// Move the head of pending into in-progress
    pub fn dequeue(&mut self, cycle: u64, now: Instant) -> Option<TaskRecord> {
        let task = self.pending.pop_front()?;
        let dispatch_id = DispatchId(self.next_dispatch);
        self.next_dispatch += 1;
        let record = TaskRecord::started(dispatch_id, cycle, task, now);
        self.in_progress.insert(dispatch_id, record.clone());
        Some(record)
    }

    /// Move a dispatch from in-progress to finished
    pub fn complete(&mut self, key: CompletionKey, current_cycle: u64, now: Instant) -> Finish {
        if key.cycle != current_cycle {
            return match self.stale.remove(&key.dispatch_id) {
                Some(mut record) => {
                    record.finished_at = Some(now);
                    Finish::Stale(record)
                }
                None => Finish::Unknown,
            };
        }
        let Some(mut record) = self.in_progress.remove(&key.dispatch_id) else {
            return Finish::Unknown;
        };
        record.seq = Some(self.next_seq);
        self.next_seq += 1;
        record.finished_at = Some(now);
        self.finished.push(record.clone());
        Finish::Current(record)
    }

    /// Reset per-cycle bookkeeping; pending is kept
    ///
    /// Dispatches still running are parked so their late completions can be
    /// reported without touching the new cycle.
    pub fn reset_cycle(&mut self) {
        let running = std::mem::take(&mut self.in_progress);
        self.stale.extend(running);
        self.finished.clear();
        self.next_seq = 0;
    }

    fn clamp(&self, range: impl RangeBounds<usize>) -> (usize, usize) {
        let len = self.pending.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .min(len);
        (start, end.max(start))
    }
}
