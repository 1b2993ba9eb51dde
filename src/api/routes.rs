use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState, websocket::activity_socket};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::get_stats))
        // Tasks
        .route("/api/tasks", post(handlers::submit_task))
        .route("/api/tasks/:id", get(handlers::get_task))
        .route("/api/dead-letters", get(handlers::list_dead_letters))
        // Per-user
        .route("/api/users/:user_id/tasks", get(handlers::list_user_tasks))
        .route("/api/users/:user_id/pause", post(handlers::pause_user))
        .route("/api/users/:user_id/resume", post(handlers::resume_user))
        .route("/api/users/:user_id/brake", get(handlers::get_brake))
        .route(
            "/api/users/:user_id/profile",
            get(handlers::get_profile).put(handlers::put_profile),
        )
        .route("/api/users/:user_id/approvals", get(handlers::list_approvals))
        .route(
            "/api/users/:user_id/approvals/count",
            get(handlers::count_approvals),
        )
        .route("/api/users/:user_id/activity", get(handlers::get_activity))
        // Approvals
        .route("/api/approvals/batch-approve", post(handlers::batch_approve))
        .route("/api/approvals/:id/approve", post(handlers::approve))
        .route("/api/approvals/:id/reject", post(handlers::reject))
        .route("/api/approvals/:id/decision", post(handlers::decide))
        // WebSocket activity stream
        .route("/ws/users/:user_id/activity", get(activity_socket))
        .with_state(state)
        .layer(cors)
}
