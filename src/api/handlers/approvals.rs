use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use crate::api::{state::AppState, types::*};
use crate::approval::BatchOutcome;
use crate::domain::{ApprovalDecision, ApprovalItem};
use crate::scheduler::ApprovalResolution;

/// GET /api/users/:user_id/approvals?status=
pub async fn list_approvals(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ApprovalQuery>,
) -> ApiResult<Vec<ApprovalItem>> {
    state
        .scheduler
        .list_approvals(&user_id, query.status)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/users/:user_id/approvals/count
pub async fn count_approvals(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<CountResponse> {
    let pending = state
        .scheduler
        .count_approvals(&user_id)
        .await
        .map_err(api_error)?;
    Ok(Json(CountResponse { user_id, pending }))
}

/// POST /api/approvals/:id/approve
///
/// 409 with `current_status` if the item already left pending.
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApprovalResolution> {
    state
        .scheduler
        .approve(id)
        .await
        .map(Json)
        .map_err(approval_error)
}

/// POST /api/approvals/:id/reject
pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    req: Option<Json<RejectRequest>>,
) -> ApiResult<ApprovalItem> {
    let reason = req.and_then(|Json(r)| r.reason);
    state
        .scheduler
        .reject(id, reason)
        .await
        .map(Json)
        .map_err(approval_error)
}

/// POST /api/approvals/:id/decision
pub async fn decide(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(decision): Json<ApprovalDecision>,
) -> ApiResult<ApprovalResolution> {
    state
        .scheduler
        .resolve_approval(id, decision)
        .await
        .map(Json)
        .map_err(approval_error)
}

/// POST /api/approvals/batch-approve
///
/// Always 200; per-item failures are listed in `failed`.
pub async fn batch_approve(
    State(state): State<AppState>,
    Json(req): Json<BatchApproveRequest>,
) -> Json<BatchOutcome> {
    Json(state.scheduler.batch_approve(&req.ids).await)
}
