//! Queued-approval workflow

pub mod queue;

pub use queue::{ApprovalError, ApprovalQueue, BatchFailure, BatchOutcome, NewApproval};
