//! HTTP surface, driven through the router without a socket.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use jobpilot::agent::{AgentRegistry, ProbeAgent, Stepwise};
use jobpilot::api::{create_router, AppState};
use jobpilot::config::AppConfig;
use jobpilot::persistence::MemoryStore;
use jobpilot::scheduler::Scheduler;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let registry = AgentRegistry::new().with(Arc::new(Stepwise(ProbeAgent)));
    let scheduler = Scheduler::new(
        &AppConfig::default(),
        Arc::new(MemoryStore::new()),
        registry,
    );
    create_router(AppState::new(scheduler))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_lists_agents() {
    let app = app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents"], json!(["probe"]));
}

#[tokio::test]
async fn submit_flow_through_approval() {
    let app = app();

    let (status, _) = call(
        &app,
        "PUT",
        "/api/users/u1/profile",
        Some(json!({ "tier": "l2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, profile) = call(&app, "GET", "/api/users/u1/profile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["tier"], "L2");

    let (status, body) = call(
        &app,
        "POST",
        "/api/tasks",
        Some(json!({
            "user_id": "u1",
            "agent_kind": "probe",
            "action": "probe_write",
            "payload": {},
            "rationale": "matches saved search",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "queued_for_approval");
    let approval_id = body["approval_id"].as_str().unwrap().to_string();

    let (_, count) = call(&app, "GET", "/api/users/u1/approvals/count", None).await;
    assert_eq!(count["pending"], 1);

    let (_, items) = call(&app, "GET", "/api/users/u1/approvals?status=pending", None).await;
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["rationale"], "matches saved search");

    let uri = format!("/api/approvals/{}/reject", approval_id);
    let (status, item) = call(&app, "POST", &uri, Some(json!({ "reason": "not a fit" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["status"], "rejected");

    // Deciding again reports the status it already has
    let uri = format!("/api/approvals/{}/approve", approval_id);
    let (status, body) = call(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["current_status"], "rejected");
}

#[tokio::test]
async fn suggestions_are_not_persisted() {
    let app = app();
    call(
        &app,
        "PUT",
        "/api/users/u1/profile",
        Some(json!({ "tier": "L1" })),
    )
    .await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/tasks",
        Some(json!({ "user_id": "u1", "agent_kind": "probe", "action": "probe_write" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "suggested");

    let (_, tasks) = call(&app, "GET", "/api/users/u1/tasks", None).await;
    assert_eq!(tasks, json!([]));
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = app();

    let (status, _) = call(
        &app,
        "GET",
        "/api/tasks/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "PUT",
        "/api/users/u1/profile",
        Some(json!({ "tier": "L7" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/api/tasks",
        Some(json!({ "user_id": "u1", "agent_kind": "oracle", "action": "probe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "GET", "/api/users/u1/profile", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn brake_endpoints() {
    let app = app();

    let (status, state) = call(
        &app,
        "POST",
        "/api/users/u1/pause",
        Some(json!({ "reason": "interviewing" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["paused"], true);
    assert_eq!(state["phase"], "paused");

    let (_, state) = call(&app, "GET", "/api/users/u1/brake", None).await;
    assert_eq!(state["reason"], "interviewing");

    let (status, state) = call(&app, "POST", "/api/users/u1/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["phase"], "running");

    let (_, events) = call(&app, "GET", "/api/users/u1/activity", None).await;
    let types: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["brake.paused", "brake.resumed"]);
}
