use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::BrakeState;

/// POST /api/users/:user_id/pause
///
/// The body is optional; `{"reason": "..."}` is recorded on the brake.
pub async fn pause_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    req: Option<Json<PauseRequest>>,
) -> ApiResult<BrakeState> {
    let reason = req.and_then(|Json(r)| r.reason);
    state
        .scheduler
        .pause(&user_id, reason)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/users/:user_id/resume
pub async fn resume_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<BrakeState> {
    state
        .scheduler
        .resume(&user_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/users/:user_id/brake
pub async fn get_brake(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<BrakeState> {
    Json(state.scheduler.brake_state(&user_id))
}
