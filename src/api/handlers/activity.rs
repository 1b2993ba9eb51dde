use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::ActivityEvent;
use crate::scheduler::validate_user_id;

/// GET /api/users/:user_id/activity?since=
///
/// Stored events only; use the WebSocket route to follow live.
pub async fn get_activity(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Vec<ActivityEvent>> {
    validate_user_id(&user_id).map_err(api_error)?;
    state
        .scheduler
        .store()
        .activity_since(&user_id, query.since)
        .await
        .map(Json)
        .map_err(api_error)
}
