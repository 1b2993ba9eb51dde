//! Emergency brake against agents that stop checking in.

mod common;

use async_trait::async_trait;
use common::*;
use jobpilot::agent::{Agent, AgentError, AgentInput, AgentOutput, Checkpoint};
use jobpilot::autonomy::ActionSpec;
use jobpilot::config::{AppConfig, PartialPolicy};
use jobpilot::domain::{BrakePhase, TaskState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Reports one step, then works for an hour without another checkpoint
struct Stubborn;

#[async_trait]
impl Agent for Stubborn {
    fn kind(&self) -> &str {
        "stubborn"
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::read("crawl")]
    }

    async fn run(
        &self,
        input: AgentInput,
        checkpoint: &mut Checkpoint,
    ) -> Result<AgentOutput, AgentError> {
        checkpoint.check()?;
        checkpoint
            .reached("warmup", json!({ "completed_steps": 1, "state": { "pages": 12 } }))
            .await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(AgentOutput::new(&input.action, "crawled everything", 0.8))
    }
}

fn config(policy: PartialPolicy) -> AppConfig {
    let mut config = AppConfig::default();
    config.brake.partial_policy = policy;
    config.scheduler.soft_timeout_secs = 7000;
    config.scheduler.hard_timeout_secs = 7200;
    config
}

async fn run_until_partial(policy: PartialPolicy) -> jobpilot::domain::Task {
    let s = started(config(policy), vec![Arc::new(Stubborn)]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(&s, request("u1", "stubborn", "crawl", json!({}))).await;
    wait_for_task(&s, task_id, |t| t.state == TaskState::Running).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = s.pause("u1", None).await.unwrap();
    assert_eq!(state.phase, BrakePhase::Pausing);

    // Inside the window nothing is forced
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(s.brake_state("u1").phase, BrakePhase::Pausing);

    let task = wait_for_task(&s, task_id, |t| t.state == TaskState::Cancelled).await;
    wait_for_phase(&s, "u1", BrakePhase::Partial).await;
    assert!(s.brake_state("u1").awaiting.is_empty());

    let events = task_events(&s, "u1", task_id).await;
    assert!(events.contains(&"task.cancelled".to_string()));
    assert!(!events.contains(&"task.succeeded".to_string()));
    assert_eq!(s.stats().cancelled_total, 1);

    // Resuming does not revive cancelled work
    s.resume("u1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        s.get_task(task_id).await.unwrap().unwrap().state,
        TaskState::Cancelled
    );
    s.shutdown();
    task
}

#[tokio::test(start_paused = true)]
async fn missed_window_persists_partial_state() {
    let task = run_until_partial(PartialPolicy::Persist).await;
    let saved = task.checkpoint.expect("checkpoint kept");
    assert_eq!(saved["state"]["pages"], json!(12));
}

#[tokio::test(start_paused = true)]
async fn missed_window_discards_partial_state() {
    let task = run_until_partial(PartialPolicy::Discard).await;
    assert!(task.checkpoint.is_none());
}

/// An agent that does reach its checkpoint inside the window is paused, not cancelled.
#[tokio::test(start_paused = true)]
async fn acknowledged_pause_is_not_forced() {
    let s = started(config(PartialPolicy::Persist), vec![]).await;
    with_profile(&s, "u1", "L0").await;

    let task_id = submit_accepted(
        &s,
        request("u1", "probe", "probe", json!({ "steps": 3, "step_delay_ms": 5000 })),
    )
    .await;
    wait_for_task(&s, task_id, |t| t.state == TaskState::Running).await;

    s.pause("u1", None).await.unwrap();
    wait_for_phase(&s, "u1", BrakePhase::Paused).await;

    // Well past the acknowledgement window
    tokio::time::sleep(Duration::from_secs(300)).await;
    let task = s.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert!(task.paused);
    assert_eq!(s.brake_state("u1").phase, BrakePhase::Paused);
    s.shutdown();
}
