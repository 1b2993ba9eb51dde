use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::UserProfile;

/// GET /api/users/:user_id/profile
pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UserProfile> {
    match state.scheduler.get_profile(&user_id).await {
        Ok(Some(profile)) => Ok(Json(profile)),
        Ok(None) => Err(not_found(format!("no profile for {}", user_id))),
        Err(e) => Err(api_error(e)),
    }
}

/// PUT /api/users/:user_id/profile
pub async fn put_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<UserProfile> {
    let mut profile = UserProfile::new(&user_id, &update.tier);
    profile.deal_breakers = update.deal_breakers;
    state
        .scheduler
        .set_profile(profile)
        .await
        .map(Json)
        .map_err(api_error)
}
