//! Periodic Sweep
//!
//! Runs every `sweep_interval_secs` alongside the workers:
//! - reaps running tasks whose heartbeat went stale
//! - expires pending approvals past their deadline
//! - dispatches approved items that never got a task
//! - force-terminates tasks behind brakes whose window elapsed
//! - purges terminal tasks past the retention window
//!
//! Each stage is independent; a failing stage is logged and the rest run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::scheduler::Scheduler;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub zombies_reaped: usize,
    pub approvals_expired: usize,
    pub approvals_reconciled: usize,
    pub brakes_partial: usize,
    pub tasks_purged: u64,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct Sweeper {
    scheduler: Scheduler,
    running: Arc<AtomicBool>,
}

impl Sweeper {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass over every stage at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.scheduler.reap_zombies(now).await {
            Ok(n) => report.zombies_reaped = n,
            Err(e) => {
                error!("Zombie sweep failed: {}", e);
                report.errors += 1;
            }
        }

        match self.scheduler.approvals().expire_due(now).await {
            Ok(expired) => report.approvals_expired = expired.len(),
            Err(e) => {
                error!("Approval expiry failed: {}", e);
                report.errors += 1;
            }
        }

        match self.scheduler.reconcile_approvals().await {
            Ok(n) => report.approvals_reconciled = n,
            Err(e) => {
                error!("Approval reconciliation failed: {}", e);
                report.errors += 1;
            }
        }

        match self.scheduler.enforce_brake_windows(now).await {
            Ok(n) => report.brakes_partial = n,
            Err(e) => {
                error!("Brake window check failed: {}", e);
                report.errors += 1;
            }
        }

        match self.scheduler.purge_expired(now).await {
            Ok(n) => report.tasks_purged = n,
            Err(e) => {
                error!("Retention purge failed: {}", e);
                report.errors += 1;
            }
        }

        if report.is_empty() {
            debug!("Sweep found nothing to do");
        } else {
            info!("Sweep: {:?}", report);
        }
        report
    }

    /// Sweep on an interval until stopped or the scheduler shuts down
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let shutdown = self.scheduler.shutdown_token();
        let period = self.scheduler.config().sweep_interval();
        info!("Sweeper started (every {:?})", period);

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Sweeper stopped");
    }
}
