use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::api::{state::AppState, types::*};
use crate::domain::{DeadLetterRecord, Task};
use crate::scheduler::{SubmitOutcome, SubmitRequest};

/// POST /api/tasks
pub async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = state.scheduler.submit_task(req).await.map_err(api_error)?;
    let status = match outcome {
        SubmitOutcome::Accepted { .. }
        | SubmitOutcome::Parked { .. }
        | SubmitOutcome::QueuedForApproval { .. } => StatusCode::ACCEPTED,
        SubmitOutcome::Suggested { .. } | SubmitOutcome::Denied { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// GET /api/tasks/:id
pub async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Task> {
    state
        .scheduler
        .get_task_status(id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/users/:user_id/tasks?state=
pub async fn list_user_tasks(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Vec<Task>> {
    state
        .scheduler
        .list_user_tasks(&user_id, query.state)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/dead-letters?agent_kind=
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Vec<DeadLetterRecord>> {
    state
        .scheduler
        .list_dead_lettered(query.agent_kind.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}
