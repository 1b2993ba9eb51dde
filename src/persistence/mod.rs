//! Persistence Layer
//!
//! The orchestrator's durable state behind one async trait:
//! - tasks with compare-and-set transitions
//! - approval items with pending-guarded resolution
//! - append-only activity log with a monotonic sequence
//! - dead letters, brake rows, user profiles and daily action counters
//!
//! `MemoryStore` backs tests and single-node runs; `PostgresStore` is the
//! durable backend.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{
    ActivityEvent, ApprovalItem, ApprovalStatus, BrakeState, DeadLetterRecord, NewActivity, Task,
    TaskState, TaskTransition, UserProfile,
};
use crate::error::{JobPilotError, Result};

/// Reject transitions the task state machine does not allow
pub(crate) fn ensure_allowed(transition: &TaskTransition) -> Result<()> {
    if transition.from.can_transition_to(transition.to) {
        Ok(())
    } else {
        Err(JobPilotError::InvalidStateTransition {
            from: transition.from.to_string(),
            to: transition.to.to_string(),
        })
    }
}

/// Result of a pending-guarded approval update
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalUpdate {
    /// The item was pending and now carries the new status
    Applied(ApprovalItem),
    /// The item had already left pending; carries it as stored
    Conflict(ApprovalItem),
    Missing,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Tasks ====================

    /// Insert a new task. Fails with `Conflict` if another task already
    /// carries the same `approval_id`.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// Atomic conditional update. Returns the updated task, or `None` when
    /// the stored task did not satisfy the transition's precondition.
    async fn transition_task(&self, id: Uuid, transition: &TaskTransition)
        -> Result<Option<Task>>;

    /// Refresh `last_heartbeat_at` of a running task. Returns false if the
    /// task is no longer running.
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<Task>>;

    async fn list_user_tasks(&self, user_id: &str, state: Option<TaskState>) -> Result<Vec<Task>>;

    async fn find_task_by_approval(&self, approval_id: Uuid) -> Result<Option<Task>>;

    /// Delete terminal tasks last updated before `before`
    async fn purge_terminal_tasks(&self, before: DateTime<Utc>) -> Result<u64>;

    // ==================== Approvals ====================

    async fn insert_approval(&self, item: &ApprovalItem) -> Result<()>;

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>>;

    async fn list_approvals(
        &self,
        user_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>>;

    async fn count_approvals(&self, user_id: &str, status: ApprovalStatus) -> Result<u64>;

    /// Move a pending item to `status`. Never touches a non-pending item.
    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ApprovalUpdate>;

    /// Record the dispatched task on an approved item
    async fn attach_approval_task(&self, approval_id: Uuid, task_id: Uuid) -> Result<()>;

    /// Pending items whose `expires_at` is before `now`
    async fn list_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalItem>>;

    /// Approved items with no dispatched task
    async fn list_undispatched_approvals(&self) -> Result<Vec<ApprovalItem>>;

    // ==================== Activity ====================

    /// Append an event, assigning `event_id`, `seq` and `timestamp`
    async fn append_activity(&self, activity: NewActivity) -> Result<ActivityEvent>;

    /// A user's events with `seq > since`, in append order
    async fn activity_since(&self, user_id: &str, since: i64) -> Result<Vec<ActivityEvent>>;

    // ==================== Dead letters ====================

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<()>;

    async fn list_dead_letters(&self, agent_kind: Option<&str>) -> Result<Vec<DeadLetterRecord>>;

    // ==================== Brake ====================

    async fn put_brake(&self, state: &BrakeState) -> Result<()>;

    async fn list_brakes(&self) -> Result<Vec<BrakeState>>;

    // ==================== Profiles ====================

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn put_profile(&self, profile: &UserProfile) -> Result<()>;

    // ==================== Daily counters ====================

    async fn daily_actions(&self, user_id: &str, day: NaiveDate) -> Result<u32>;

    /// Increment the counter if it is below `cap`. Returns whether it was.
    async fn try_consume_daily_action(&self, user_id: &str, day: NaiveDate, cap: u32)
        -> Result<bool>;
}
