use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Persisted and waiting for a worker
    Accepted,
    /// Owned by exactly one worker
    Running,
    /// Finished with a structured output
    Succeeded,
    /// Last attempt failed; retry or dead-letter decision pending
    Failed,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Retries exhausted or fatal failure
    DeadLettered,
    /// Force-terminated by the brake
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Accepted => "accepted",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::DeadLettered => "dead_lettered",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        match (self, target) {
            // From Accepted
            (Accepted, Running) => true,
            (Accepted, Cancelled) => true,

            // From Running
            (Running, Succeeded) => true,
            (Running, Failed) => true,
            (Running, Cancelled) => true, // Brake force-termination
            (Running, Running) => true,   // Pause marker set/cleared

            // From Failed
            (Failed, Retrying) => true,
            (Failed, DeadLettered) => true,

            // From Retrying
            (Retrying, Running) => true,
            (Retrying, Cancelled) => true,

            // Terminal states never move
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<TaskState> {
        use TaskState::*;

        match self {
            Accepted => vec![Running, Cancelled],
            Running => vec![Running, Succeeded, Failed, Cancelled],
            Failed => vec![Retrying, DeadLettered],
            Retrying => vec![Running, Cancelled],
            Succeeded | DeadLettered | Cancelled => vec![],
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::DeadLettered | TaskState::Cancelled
        )
    }

    /// States a worker may claim from
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskState::Accepted | TaskState::Retrying)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TaskState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "accepted" => Ok(TaskState::Accepted),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "retrying" => Ok(TaskState::Retrying),
            "dead_lettered" => Ok(TaskState::DeadLettered),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Fatal,
    SoftTimeout,
    HardTimeout,
    /// Heartbeat went stale and the zombie sweep reaped the task
    Zombie,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Fatal)
    }
}

/// One failed attempt in a task's error history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Failed-attempt number, starting at 1
    pub attempt: u32,
    pub kind: FailureKind,
    pub error: String,
    /// Backoff applied before the next attempt, if one was scheduled
    pub retry_delay_secs: Option<u64>,
    pub at: DateTime<Utc>,
}

/// A unit of background agent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub agent_kind: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    /// Number of failed attempts so far
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while the task sits in `running` after acknowledging a pause
    pub paused: bool,
    /// Partial state saved at the last honored pause or soft timeout
    pub checkpoint: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error_history: Vec<AttemptFailure>,
    /// Approval item that authorized this dispatch
    pub approval_id: Option<Uuid>,
}

impl Task {
    /// Create a new accepted task
    pub fn new(
        user_id: &str,
        agent_kind: &str,
        action: &str,
        payload: serde_json::Value,
        limits: TaskLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            agent_kind: agent_kind.to_string(),
            action: action.to_string(),
            payload,
            state: TaskState::Accepted,
            attempt_count: 0,
            max_attempts: limits.max_attempts,
            soft_timeout_secs: limits.soft_timeout_secs,
            hard_timeout_secs: limits.hard_timeout_secs,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
            next_attempt_at: None,
            paused: false,
            checkpoint: None,
            result: None,
            error_history: Vec::new(),
            approval_id: None,
        }
    }

    pub fn with_approval(mut self, approval_id: Uuid) -> Self {
        self.approval_id = Some(approval_id);
        self
    }

    /// Key used to serialize conflicting work for one user and agent
    pub fn lane(&self) -> (String, String) {
        (self.user_id.clone(), self.agent_kind.clone())
    }

    /// Heartbeat is older than `threshold` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        if self.state != TaskState::Running || self.paused {
            return false;
        }
        let last = self.last_heartbeat_at.unwrap_or(self.updated_at);
        now - last > threshold
    }
}

/// Per-task retry and timeout limits stamped at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLimits {
    pub max_attempts: u32,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            soft_timeout_secs: 240,
            hard_timeout_secs: 300,
        }
    }
}

/// A single-row conditional update.
///
/// Applied only when the stored task is in `from` (and, if `expect_paused`
/// is set, has that pause marker). Fields left as `None` are not touched.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub expect_paused: Option<bool>,
    pub paused: Option<bool>,
    pub attempt_count: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub checkpoint: Option<Option<serde_json::Value>>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<AttemptFailure>,
    pub at: DateTime<Utc>,
}

impl TaskTransition {
    pub fn new(from: TaskState, to: TaskState) -> Self {
        Self {
            from,
            to,
            expect_paused: None,
            paused: None,
            attempt_count: None,
            heartbeat_at: None,
            next_attempt_at: None,
            checkpoint: None,
            result: None,
            failure: None,
            at: Utc::now(),
        }
    }

    pub fn expect_paused(mut self, paused: bool) -> Self {
        self.expect_paused = Some(paused);
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    pub fn attempt_count(mut self, count: u32) -> Self {
        self.attempt_count = Some(count);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.heartbeat_at = Some(at);
        self
    }

    pub fn next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn checkpoint(mut self, data: Option<serde_json::Value>) -> Self {
        self.checkpoint = Some(data);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn failure(mut self, failure: AttemptFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Whether `task` satisfies the precondition of this transition
    pub fn matches(&self, task: &Task) -> bool {
        task.state == self.from && self.expect_paused.map_or(true, |p| task.paused == p)
    }

    /// Apply the transition to an in-memory copy
    pub fn apply(&self, task: &mut Task) {
        task.state = self.to;
        task.updated_at = self.at;
        if let Some(paused) = self.paused {
            task.paused = paused;
        }
        if let Some(count) = self.attempt_count {
            task.attempt_count = count;
        }
        if let Some(at) = self.heartbeat_at {
            task.last_heartbeat_at = Some(at);
        }
        if let Some(next) = self.next_attempt_at {
            task.next_attempt_at = next;
        }
        if let Some(checkpoint) = &self.checkpoint {
            task.checkpoint = checkpoint.clone();
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(failure) = &self.failure {
            task.error_history.push(failure.clone());
        }
    }
}
