use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Brake phase for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrakePhase {
    #[default]
    Running,
    /// Pause requested, waiting for running tasks to reach a checkpoint
    Pausing,
    /// Every running task acknowledged
    Paused,
    /// Some tasks missed the acknowledgement window and were force-terminated
    Partial,
}

impl BrakePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrakePhase::Running => "running",
            BrakePhase::Pausing => "pausing",
            BrakePhase::Paused => "paused",
            BrakePhase::Partial => "partial",
        }
    }

    pub fn can_transition_to(&self, target: BrakePhase) -> bool {
        use BrakePhase::*;

        matches!(
            (self, target),
            (Running, Pausing)
                | (Running, Paused)
                | (Pausing, Paused)
                | (Pausing, Partial)
                | (Pausing, Running)
                | (Paused, Running)
                | (Partial, Running)
        )
    }
}

impl fmt::Display for BrakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BrakePhase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "running" => Ok(BrakePhase::Running),
            "pausing" => Ok(BrakePhase::Pausing),
            "paused" => Ok(BrakePhase::Paused),
            "partial" => Ok(BrakePhase::Partial),
            other => Err(format!("unknown brake phase: {}", other)),
        }
    }
}

/// One row per user; an absent row means running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrakeState {
    pub user_id: String,
    pub paused: bool,
    pub phase: BrakePhase,
    pub paused_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    /// Running tasks that have not yet acknowledged the pause
    pub awaiting: Vec<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl BrakeState {
    pub fn running(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            paused: false,
            phase: BrakePhase::Running,
            paused_at: None,
            reason: None,
            awaiting: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(BrakePhase::Running.can_transition_to(BrakePhase::Pausing));
        assert!(BrakePhase::Running.can_transition_to(BrakePhase::Paused));
        assert!(BrakePhase::Pausing.can_transition_to(BrakePhase::Partial));
        assert!(BrakePhase::Partial.can_transition_to(BrakePhase::Running));
        assert!(!BrakePhase::Paused.can_transition_to(BrakePhase::Partial));
        assert!(!BrakePhase::Running.can_transition_to(BrakePhase::Partial));
    }
}
