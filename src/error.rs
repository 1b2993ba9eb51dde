use thiserror::Error;

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum JobPilotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Submission errors (returned synchronously, never retried)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic check failed; the caller should reconcile with the current state
    #[error("Conflict: {0}")]
    Conflict(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl JobPilotError {
    /// Whether the error is the caller's fault (bad input or stale view)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            JobPilotError::Validation(_)
                | JobPilotError::NotFound(_)
                | JobPilotError::Conflict(_)
                | JobPilotError::InvalidStateTransition { .. }
        )
    }
}

/// Result type alias for JobPilotError
pub type Result<T> = std::result::Result<T, JobPilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JobPilotError::InvalidStateTransition {
            from: "succeeded".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: from succeeded to running"
        );
        assert!(err.is_client_error());
        assert!(!JobPilotError::Internal("boom".into()).is_client_error());
    }
}
