//! Scheduling: submission, worker pools, retries and the periodic sweep

pub mod lanes;
pub mod retry;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod stats;
pub mod sweeper;

pub use lanes::{LaneKey, Lanes};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{
    validate_user_id, ApprovalResolution, Scheduler, SubmitOutcome, SubmitRequest,
};
pub use stats::{SchedulerCounters, SchedulerStats};
pub use sweeper::{SweepReport, Sweeper};
