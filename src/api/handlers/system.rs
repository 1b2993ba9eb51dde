use axum::{extract::State, Json};

use crate::api::{state::AppState, types::*};
use crate::scheduler::SchedulerStats;

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_seconds(),
        agents: state.scheduler.registry().kinds(),
    })
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats())
}
