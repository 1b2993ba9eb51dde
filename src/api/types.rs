use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::approval::ApprovalError;
use crate::autonomy::DealBreaker;
use crate::domain::{ApprovalStatus, TaskState};
use crate::error::JobPilotError;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Status the approval actually has, on a conflicting decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<ApprovalStatus>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn error_body(status: StatusCode, message: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message,
            current_status: None,
        }),
    )
}

pub fn api_error(e: JobPilotError) -> ApiError {
    let status = match &e {
        JobPilotError::Validation(_) => StatusCode::BAD_REQUEST,
        JobPilotError::NotFound(_) => StatusCode::NOT_FOUND,
        JobPilotError::Conflict(_) | JobPilotError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        _ => {
            error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, e.to_string())
}

pub fn approval_error(e: ApprovalError) -> ApiError {
    let current_status = e.current_status();
    let message = e.to_string();
    let status = match e {
        ApprovalError::Store(inner) => return api_error(inner),
        ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
        ApprovalError::Conflict { .. } | ApprovalError::Expired(_) => StatusCode::CONFLICT,
    };
    (
        status,
        Json(ErrorResponse {
            error: message,
            current_status,
        }),
    )
}

pub fn not_found(what: String) -> ApiError {
    error_body(StatusCode::NOT_FOUND, what)
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub state: Option<TaskState>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalQuery {
    pub status: Option<ApprovalStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub agent_kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    /// Only events with a greater `seq`
    #[serde(default)]
    pub since: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchApproveRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileUpdate {
    pub tier: String,
    #[serde(default)]
    pub deal_breakers: Vec<DealBreaker>,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub user_id: String,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: i64,
    pub agents: Vec<String>,
}
