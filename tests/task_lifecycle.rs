//! End-to-end task lifecycle against the in-memory store.
//!
//! Tokio time is paused, so retry backoff and agent step delays elapse
//! instantly while keeping their order.

mod common;

use async_trait::async_trait;
use common::*;
use jobpilot::agent::{AgentError, AgentInput, AgentOutput, Stepwise, StepwiseAgent};
use jobpilot::autonomy::ActionSpec;
use jobpilot::config::AppConfig;
use jobpilot::domain::{ApprovalStatus, BrakePhase, FailureKind, TaskState};
use jobpilot::persistence::Store;
use jobpilot::scheduler::SubmitOutcome;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Reads one listing page per step, a second each
struct Scout;

#[async_trait]
impl StepwiseAgent for Scout {
    fn kind(&self) -> &str {
        "scout"
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::read("search")]
    }

    fn plan(&self, input: &AgentInput) -> Vec<String> {
        let pages = input.payload.get("pages").and_then(Value::as_u64).unwrap_or(4);
        (1..=pages).map(|i| format!("page-{}", i)).collect()
    }

    async fn step(
        &self,
        _step: &str,
        _input: &AgentInput,
        state: &mut Value,
    ) -> Result<(), AgentError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let read = state.get("pages").and_then(Value::as_u64).unwrap_or(0);
        *state = json!({ "pages": read + 1 });
        Ok(())
    }

    fn finish(&self, input: &AgentInput, state: Value) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput::new(&input.action, "searched listings", 0.8).with_data(state))
    }
}

/// An L2 write waits for approval, and approving it runs it exactly once.
#[tokio::test(start_paused = true)]
async fn approved_write_runs_once() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L2").await;

    let outcome = s
        .submit_task(request("u1", "probe", "probe_write", json!({ "steps": 2 })))
        .await
        .unwrap();
    let approval_id = match outcome {
        SubmitOutcome::QueuedForApproval { approval_id, .. } => approval_id,
        other => panic!("expected approval, got {:?}", other),
    };
    assert!(s.list_user_tasks("u1", None).await.unwrap().is_empty());
    assert_eq!(s.count_approvals("u1").await.unwrap(), 1);

    let resolution = s.approve(approval_id).await.unwrap();
    assert_eq!(resolution.item.status, ApprovalStatus::Approved);
    let task_id = resolution.task_id.expect("approval dispatched a task");

    let task = wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    assert_eq!(task.approval_id, Some(approval_id));
    assert_eq!(task.attempt_count, 0);
    assert!(task.result.is_some());
    assert_eq!(s.count_approvals("u1").await.unwrap(), 0);

    let events = task_events(&s, "u1", task_id).await;
    assert_eq!(events.iter().filter(|e| *e == "task.succeeded").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "task.running").count(), 1);

    // A second decision on the same item is a conflict
    assert!(s.approve(approval_id).await.is_err());
    assert_eq!(s.list_user_tasks("u1", None).await.unwrap().len(), 1);
    s.shutdown();
}

/// Two transient failures, then success on the third attempt.
#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(
        &s,
        request("u1", "probe", "probe", json!({ "fail_attempts": 2 })),
    )
    .await;

    let task = wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.error_history.len(), 2);
    assert!(task
        .error_history
        .iter()
        .all(|f| f.kind == FailureKind::Transient));
    let delays: Vec<Option<u64>> = task
        .error_history
        .iter()
        .map(|f| f.retry_delay_secs)
        .collect();
    assert_eq!(delays, vec![Some(30), Some(60)]);

    let events = task_events(&s, "u1", task_id).await;
    assert_eq!(events.iter().filter(|e| *e == "task.retrying").count(), 2);
    assert_eq!(events.last().map(String::as_str), Some("task.succeeded"));

    let stats = s.stats();
    assert_eq!(stats.retried_total, 2);
    assert_eq!(stats.succeeded_total, 1);
    s.shutdown();
}

/// A task that never succeeds is dead-lettered after `max_attempts`.
#[tokio::test(start_paused = true)]
async fn exhausted_task_is_dead_lettered() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(
        &s,
        request("u1", "probe", "probe", json!({ "fail_attempts": 10 })),
    )
    .await;

    let task = wait_for_task(&s, task_id, |t| t.state == TaskState::DeadLettered).await;
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.error_history.len(), 3);
    assert_eq!(task.error_history[2].retry_delay_secs, None);

    let records = s.list_dead_lettered(Some("probe")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task_id, task_id);
    assert_eq!(records[0].attempt_count, 3);
    assert!(records[0].final_error.contains("probe failing attempt 2"));
    assert!(s.list_dead_lettered(Some("scout")).await.unwrap().is_empty());
    s.shutdown();
}

/// A last step that ends after the soft timeout still counts as done.
#[tokio::test(start_paused = true)]
async fn last_step_past_soft_timeout_succeeds() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(
        &s,
        request(
            "u1",
            "probe",
            "probe",
            json!({ "steps": 1, "step_delay_ms": 250_000 }),
        ),
    )
    .await;

    let task = wait_for_task(&s, task_id, |t| t.state.is_terminal()).await;
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt_count, 0);
    assert!(task.error_history.is_empty());
    s.shutdown();
}

/// A fatal failure skips the retries.
#[tokio::test(start_paused = true)]
async fn fatal_failure_is_dead_lettered_immediately() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id =
        submit_accepted(&s, request("u1", "probe", "probe", json!({ "fatal": true }))).await;

    let task = wait_for_task(&s, task_id, |t| t.state == TaskState::DeadLettered).await;
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.error_history[0].kind, FailureKind::Fatal);
    s.shutdown();
}

/// Pausing mid-run stops at the next checkpoint; resuming finishes the
/// remaining steps from the saved state.
#[tokio::test(start_paused = true)]
async fn pause_and_resume_mid_run() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(
        &s,
        request(
            "u1",
            "probe",
            "probe",
            json!({ "steps": 5, "step_delay_ms": 1000 }),
        ),
    )
    .await;
    wait_for_task(&s, task_id, |t| t.state == TaskState::Running).await;
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let state = s.pause("u1", Some("vacation".into())).await.unwrap();
    assert!(state.paused);
    assert_eq!(state.phase, BrakePhase::Pausing);
    assert_eq!(state.awaiting, vec![task_id]);

    let paused = wait_for_task(&s, task_id, |t| t.paused).await;
    assert_eq!(paused.state, TaskState::Running);
    let completed = paused.checkpoint.as_ref().unwrap()["completed_steps"]
        .as_u64()
        .unwrap();
    assert!(completed >= 1 && completed < 5);
    wait_for_phase(&s, "u1", BrakePhase::Paused).await;

    // Nothing moves while paused
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    let still = s.get_task(task_id).await.unwrap().unwrap();
    assert!(still.paused);

    let state = s.resume("u1").await.unwrap();
    assert_eq!(state.phase, BrakePhase::Running);

    let done = wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    assert_eq!(done.attempt_count, 0);
    let visited = done.result.as_ref().unwrap()["data"]["visited"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(visited, 5);

    let events = task_events(&s, "u1", task_id).await;
    assert_eq!(events.iter().filter(|e| *e == "task.succeeded").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "task.paused").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "task.step").count(), 5);
    s.shutdown();
}

/// Tasks of different kinds all stop under one brake, and resume picks each
/// of them up exactly once.
#[tokio::test(start_paused = true)]
async fn pause_and_resume_across_agent_kinds() {
    let s = started(AppConfig::default(), vec![Arc::new(Stepwise(Scout))]).await;
    with_profile(&s, "u1", "L0").await;

    let ids = vec![
        submit_accepted(
            &s,
            request(
                "u1",
                "probe",
                "probe",
                json!({ "steps": 5, "step_delay_ms": 1000 }),
            ),
        )
        .await,
        submit_accepted(&s, request("u1", "scout", "search", json!({ "pages": 5 }))).await,
    ];
    for id in &ids {
        wait_for_task(&s, *id, |t| t.state == TaskState::Running).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let state = s.pause("u1", None).await.unwrap();
    assert_eq!(state.phase, BrakePhase::Pausing);
    assert_eq!(state.awaiting.len(), 2);

    for id in &ids {
        let paused = wait_for_task(&s, *id, |t| t.paused).await;
        assert_eq!(paused.state, TaskState::Running);
    }
    wait_for_phase(&s, "u1", BrakePhase::Paused).await;

    s.resume("u1").await.unwrap();
    for id in &ids {
        wait_for_task(&s, *id, |t| t.state == TaskState::Succeeded).await;
    }

    let events = s.store().activity_since("u1", 0).await.unwrap();
    for id in &ids {
        let resumed_runs = events
            .iter()
            .filter(|e| e.task_id == Some(*id) && e.event_type == "task.running")
            .filter(|e| e.data["resumed"] == json!(true))
            .count();
        assert_eq!(resumed_runs, 1, "task {} resumed {} times", id, resumed_runs);

        let steps = events
            .iter()
            .filter(|e| e.task_id == Some(*id) && e.event_type == "task.step")
            .count();
        assert_eq!(steps, 5);
    }
    s.shutdown();
}

/// Work submitted while paused is parked and runs after resume.
#[tokio::test(start_paused = true)]
async fn parked_task_runs_after_resume() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L0").await;
    let state = s.pause("u1", None).await.unwrap();
    assert_eq!(state.phase, BrakePhase::Paused);

    let task_id = match s
        .submit_task(request("u1", "probe", "probe", json!({})))
        .await
        .unwrap()
    {
        SubmitOutcome::Parked { task_id } => task_id,
        other => panic!("expected parked, got {:?}", other),
    };

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert_eq!(
        s.get_task(task_id).await.unwrap().unwrap().state,
        TaskState::Accepted
    );

    s.resume("u1").await.unwrap();
    wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    s.shutdown();
}

/// Two concurrent approvals of one item: one wins, one task runs.
#[tokio::test(start_paused = true)]
async fn concurrent_approvals_dispatch_once() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L2").await;

    let approval_id = match s
        .submit_task(request("u1", "probe", "probe_write", json!({})))
        .await
        .unwrap()
    {
        SubmitOutcome::QueuedForApproval { approval_id, .. } => approval_id,
        other => panic!("expected approval, got {:?}", other),
    };

    let (a, b) = tokio::join!(s.approve(approval_id), s.approve(approval_id));
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one approval should win"
    );
    let task_id = a.or(b).unwrap().task_id.unwrap();

    wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    assert_eq!(s.list_user_tasks("u1", None).await.unwrap().len(), 1);
    let events = task_events(&s, "u1", task_id).await;
    assert_eq!(events.iter().filter(|e| *e == "task.succeeded").count(), 1);
    s.shutdown();
}

/// Batch approval dispatches every pending item and reports the rest.
#[tokio::test(start_paused = true)]
async fn batch_approve_dispatches_each_item() {
    let s = started(AppConfig::default(), vec![]).await;
    with_profile(&s, "u1", "L2").await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        match s
            .submit_task(request("u1", "probe", "probe_write", json!({})))
            .await
            .unwrap()
        {
            SubmitOutcome::QueuedForApproval { approval_id, .. } => ids.push(approval_id),
            other => panic!("expected approval, got {:?}", other),
        }
    }
    s.reject(ids[2], Some("not now".into())).await.unwrap();

    let outcome = s.batch_approve(&ids).await;
    assert_eq!(outcome.approved.len(), 2);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].id, ids[2]);
    assert_eq!(outcome.failed[0].current_status, Some(ApprovalStatus::Rejected));

    for item in &outcome.approved {
        let task_id = item.task_id.unwrap();
        wait_for_task(&s, task_id, |t| t.state == TaskState::Succeeded).await;
    }
    s.shutdown();
}
