use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters, updated lock-free by workers
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
    zombies_reaped: AtomicU64,
}

impl SchedulerCounters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zombie(&self) {
        self.zombies_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, running: usize, queued: usize) -> SchedulerStats {
        SchedulerStats {
            submitted_total: self.submitted.load(Ordering::Relaxed),
            succeeded_total: self.succeeded.load(Ordering::Relaxed),
            retried_total: self.retried.load(Ordering::Relaxed),
            dead_lettered_total: self.dead_lettered.load(Ordering::Relaxed),
            cancelled_total: self.cancelled.load(Ordering::Relaxed),
            zombies_reaped_total: self.zombies_reaped.load(Ordering::Relaxed),
            running,
            queued,
        }
    }
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted_total: u64,
    pub succeeded_total: u64,
    pub retried_total: u64,
    pub dead_lettered_total: u64,
    pub cancelled_total: u64,
    pub zombies_reaped_total: u64,
    /// Attempts executing on this node
    pub running: usize,
    /// Tasks waiting behind a held lane
    pub queued: usize,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scheduler[run={}, queued={}, sub={}, ok={}, retry={}, dlq={}, cancel={}, zombie={}]",
            self.running,
            self.queued,
            self.submitted_total,
            self.succeeded_total,
            self.retried_total,
            self.dead_lettered_total,
            self.cancelled_total,
            self.zombies_reaped_total
        )
    }
}
