use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{AttemptFailure, Task};

/// Structured failure record for a task that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: String,
    pub agent_kind: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub final_error: String,
    pub error_history: Vec<AttemptFailure>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Build the record from the task as it was dead-lettered
    pub fn from_task(task: &Task) -> Self {
        let final_error = task
            .error_history
            .last()
            .map(|f| f.error.clone())
            .unwrap_or_else(|| "unknown error".to_string());

        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            user_id: task.user_id.clone(),
            agent_kind: task.agent_kind.clone(),
            action: task.action.clone(),
            payload: task.payload.clone(),
            attempt_count: task.attempt_count,
            final_error,
            error_history: task.error_history.clone(),
            created_at: Utc::now(),
        }
    }
}
