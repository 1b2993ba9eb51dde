//! Agent trait: one unit of background work for one task attempt

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::checkpoint::Checkpoint;
use super::output::AgentOutput;
use crate::autonomy::ActionSpec;

/// What the agent is asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub task_id: Uuid,
    pub user_id: String,
    pub action: String,
    pub payload: Value,
    /// Failed attempts before this one
    pub attempt: u32,
    /// Partial state saved by an earlier pause or soft timeout
    pub resume_from: Option<Value>,
}

/// Why an agent stopped at a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    /// The user's brake is engaged
    Paused,
    /// Soft timeout elapsed; save partial state and stop
    SaveRequested,
    /// Force-terminated
    Cancelled,
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::Paused => write!(f, "paused"),
            Interrupt::SaveRequested => write!(f, "save requested"),
            Interrupt::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Agent failure classification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// Worth retrying (network blip, rate limit, flaky upstream)
    #[error("transient agent error: {0}")]
    Transient(String),
    /// Retrying will not help (bad input, contract violation)
    #[error("fatal agent error: {0}")]
    Fatal(String),
    #[error("interrupted: {0}")]
    Interrupted(Interrupt),
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent kind, e.g. `scout` or `applier`
    fn kind(&self) -> &str;

    /// Actions this agent can perform, with their read/write classification
    fn actions(&self) -> Vec<ActionSpec>;

    /// Reject malformed payloads before anything is persisted
    fn validate_payload(&self, _action: &str, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Run one attempt. Call `checkpoint.check` before each step and return
    /// its error unchanged, then `checkpoint.reached` once the step is done.
    async fn run(
        &self,
        input: AgentInput,
        checkpoint: &mut Checkpoint,
    ) -> Result<AgentOutput, AgentError>;
}
