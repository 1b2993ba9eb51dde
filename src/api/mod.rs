//! HTTP surface over the scheduler
//!
//! JSON routes for tasks, the brake, approvals, profiles and dead letters,
//! plus a WebSocket that replays a user's activity and then follows it live.

pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use routes::create_router;
pub use state::AppState;
