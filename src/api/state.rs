use chrono::{DateTime, Utc};

use crate::scheduler::Scheduler;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            start_time: Utc::now(),
        }
    }

    /// Get system uptime in seconds
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
