//! Historical backfills: the disk-scan seam and the task queue feeding
//! active streams.
//!
//! Tasks hold weak stream references and resolve-or-drop on every slice, so
//! a stream dying mid-backfill tears down without reference cycles. The
//! queue is poll-driven: the embedding server's scheduler (or a test) calls
//! [`BackfillManager::run_once`] / [`BackfillManager::drive`]; a task that
//! overruns the shared byte budget parks until `next()` drains enough.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::stream::Stream;

use sluice_core::{Item, Limits, Seqno, Vbid};

use crate::stream::active::ActiveStream;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackfillError {
    #[error("disk scan failed: {reason}")]
    ScanFailed { reason: String },
}

/// Where a backfilled item was read from, for stat accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackfillSourceKind {
    Memory,
    Disk,
}

/// Point-in-time scan result: items with seqnos in `(start, end]`, already
/// ordered. `end` is the last seqno the scan actually covers, which becomes
/// the disk snapshot boundary on the wire.
#[derive(Clone, Debug)]
pub struct DiskSnapshot {
    pub start: Seqno,
    pub end: Seqno,
    pub items: Vec<Item>,
}

/// Storage seam: scan persisted history for a vbucket.
pub trait BackfillSource: Send + Sync {
    fn scan(&self, vbucket: Vbid, start: Seqno, end: Seqno) -> Result<DiskSnapshot, BackfillError>;
}

/// Producer-wide budget for backfill bytes held pending dispatch.
#[derive(Debug)]
pub struct BackfillBudget {
    used: AtomicU64,
    limit: u64,
}

impl BackfillBudget {
    fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn over_limit(&self) -> bool {
        self.used.load(Ordering::Relaxed) > self.limit
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// One `run_once` step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// No tasks queued.
    Idle,
    /// A task made progress (or was retired).
    Progressed,
    /// The front task is waiting for budget and was requeued.
    Paused,
}

enum TaskPhase {
    Scan,
    Feed { items: VecDeque<Item> },
}

struct BackfillTask {
    stream: Weak<ActiveStream>,
    source: Arc<dyn BackfillSource>,
    vbucket: Vbid,
    start: Seqno,
    end: Seqno,
    phase: TaskPhase,
}

pub struct BackfillManager {
    budget: Arc<BackfillBudget>,
    tasks: Mutex<VecDeque<BackfillTask>>,
}

impl BackfillManager {
    pub fn new(limits: &Limits) -> Self {
        Self {
            budget: Arc::new(BackfillBudget::new(limits.backfill_budget_bytes as u64)),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn budget(&self) -> Arc<BackfillBudget> {
        Arc::clone(&self.budget)
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.lock().expect("backfill task lock poisoned").len()
    }

    /// Queue a scan over `(start, end]` feeding `stream`.
    pub fn schedule(
        &self,
        stream: &Arc<ActiveStream>,
        source: Arc<dyn BackfillSource>,
        start: Seqno,
        end: Seqno,
    ) {
        let task = BackfillTask {
            stream: Arc::downgrade(stream),
            source,
            vbucket: stream.ident().vbucket(),
            start,
            end,
            phase: TaskPhase::Scan,
        };
        tracing::debug!(vb = %task.vbucket, %start, %end, "backfill scheduled");
        self.tasks
            .lock()
            .expect("backfill task lock poisoned")
            .push_back(task);
    }

    /// Advance the front task by one slice. The task is moved out of the
    /// queue before any stream call, so stream teardown never runs inside
    /// the task-queue lock.
    pub fn run_once(&self) -> RunOutcome {
        let Some(mut task) = self
            .tasks
            .lock()
            .expect("backfill task lock poisoned")
            .pop_front()
        else {
            return RunOutcome::Idle;
        };

        let Some(stream) = task.stream.upgrade() else {
            tracing::debug!(vb = %task.vbucket, "backfill dropped: stream gone");
            return RunOutcome::Progressed;
        };
        if !stream.is_active() {
            tracing::debug!(vb = %task.vbucket, "backfill dropped: stream dead");
            return RunOutcome::Progressed;
        }

        let phase = std::mem::replace(&mut task.phase, TaskPhase::Scan);
        match phase {
            TaskPhase::Scan => match task.source.scan(task.vbucket, task.start, task.end) {
                Ok(snapshot) if snapshot.items.is_empty() => {
                    stream.complete_backfill();
                    RunOutcome::Progressed
                }
                Ok(snapshot) => {
                    stream.incr_backfill_remaining(snapshot.items.len() as u64);
                    stream.mark_disk_snapshot(snapshot.start, snapshot.end);
                    task.phase = TaskPhase::Feed {
                        items: VecDeque::from(snapshot.items),
                    };
                    self.requeue(task);
                    RunOutcome::Progressed
                }
                Err(err) => {
                    stream.backfill_failed(&err);
                    RunOutcome::Progressed
                }
            },
            TaskPhase::Feed { mut items } => {
                while let Some(item) = items.pop_front() {
                    if !stream.backfill_received(item.clone(), BackfillSourceKind::Disk) {
                        items.push_front(item);
                        task.phase = TaskPhase::Feed { items };
                        self.requeue(task);
                        return RunOutcome::Paused;
                    }
                }
                stream.complete_backfill();
                RunOutcome::Progressed
            }
        }
    }

    /// Run until the queue is idle or every remaining task is parked on the
    /// budget; returns the number of slices that made progress.
    pub fn drive(&self) -> usize {
        let mut progressed = 0;
        let mut paused_streak = 0;
        loop {
            match self.run_once() {
                RunOutcome::Idle => return progressed,
                RunOutcome::Progressed => {
                    progressed += 1;
                    paused_streak = 0;
                }
                RunOutcome::Paused => {
                    paused_streak += 1;
                    if paused_streak >= self.num_tasks().max(1) {
                        return progressed;
                    }
                }
            }
        }
    }

    fn requeue(&self, task: BackfillTask) {
        self.tasks
            .lock()
            .expect("backfill task lock poisoned")
            .push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_release_saturates() {
        let budget = BackfillBudget::new(100);
        budget.charge(60);
        assert!(!budget.over_limit());
        budget.charge(60);
        assert!(budget.over_limit());
        budget.release(200);
        assert_eq!(budget.bytes_in_use(), 0);
        assert!(!budget.over_limit());
    }

    #[test]
    fn run_once_is_idle_with_no_tasks() {
        let manager = BackfillManager::new(&Limits::default());
        assert_eq!(manager.run_once(), RunOutcome::Idle);
        assert_eq!(manager.drive(), 0);
    }
}
