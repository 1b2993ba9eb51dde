use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of activity the core publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    TaskAccepted,
    TaskParked,
    TaskRunning,
    TaskStep,
    TaskPaused,
    TaskSucceeded,
    TaskFailed,
    TaskRetrying,
    TaskDeadLettered,
    TaskCancelled,
    BrakePausing,
    BrakePaused,
    BrakePartial,
    BrakeResumed,
    ApprovalCreated,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
}

impl ActivityKind {
    /// `{domain}.{event}` form stored with every event
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::TaskAccepted => "task.accepted",
            ActivityKind::TaskParked => "task.parked",
            ActivityKind::TaskRunning => "task.running",
            ActivityKind::TaskStep => "task.step",
            ActivityKind::TaskPaused => "task.paused",
            ActivityKind::TaskSucceeded => "task.succeeded",
            ActivityKind::TaskFailed => "task.failed",
            ActivityKind::TaskRetrying => "task.retrying",
            ActivityKind::TaskDeadLettered => "task.dead_lettered",
            ActivityKind::TaskCancelled => "task.cancelled",
            ActivityKind::BrakePausing => "brake.pausing",
            ActivityKind::BrakePaused => "brake.paused",
            ActivityKind::BrakePartial => "brake.partial",
            ActivityKind::BrakeResumed => "brake.resumed",
            ActivityKind::ApprovalCreated => "approval.created",
            ActivityKind::ApprovalApproved => "approval.approved",
            ActivityKind::ApprovalRejected => "approval.rejected",
            ActivityKind::ApprovalExpired => "approval.expired",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event waiting to be appended
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: String,
    pub task_id: Option<Uuid>,
    pub kind: ActivityKind,
    pub data: serde_json::Value,
}

impl NewActivity {
    pub fn new(user_id: &str, kind: ActivityKind, data: serde_json::Value) -> Self {
        Self {
            user_id: user_id.to_string(),
            task_id: None,
            kind,
            data,
        }
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Append-only activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_id: Uuid,
    /// Monotonic append order
    pub seq: i64,
    pub user_id: String,
    pub task_id: Option<Uuid>,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    /// Pub/sub channel: `{domain}.{user_id}.{event}`
    pub fn channel(&self) -> String {
        match self.event_type.split_once('.') {
            Some((domain, event)) => format!("{}.{}.{}", domain, self.user_id, event),
            None => format!("{}.{}", self.event_type, self.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_naming() {
        let event = ActivityEvent {
            event_id: Uuid::new_v4(),
            seq: 7,
            user_id: "user-42".to_string(),
            task_id: None,
            event_type: ActivityKind::BrakePaused.as_str().to_string(),
            data: json!({}),
            timestamp: Utc::now(),
        };
        assert_eq!(event.channel(), "brake.user-42.paused");
    }
}
