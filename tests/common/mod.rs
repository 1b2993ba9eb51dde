#![allow(dead_code)]

use jobpilot::agent::{Agent, AgentRegistry, ProbeAgent, Stepwise};
use jobpilot::config::AppConfig;
use jobpilot::domain::{BrakePhase, Task, UserProfile};
use jobpilot::persistence::{MemoryStore, Store};
use jobpilot::scheduler::{Scheduler, SubmitOutcome, SubmitRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POLL: Duration = Duration::from_millis(250);
const MAX_POLLS: usize = 20_000;

/// Started scheduler over an in-memory store with the probe agent plus `extra`
pub async fn started(config: AppConfig, extra: Vec<Arc<dyn Agent>>) -> Scheduler {
    let mut registry = AgentRegistry::new().with(Arc::new(Stepwise(ProbeAgent)));
    for agent in extra {
        registry.register(agent);
    }
    let scheduler = Scheduler::new(&config, Arc::new(MemoryStore::new()), registry);
    scheduler.start().await.unwrap();
    scheduler
}

pub async fn with_profile(scheduler: &Scheduler, user_id: &str, tier: &str) {
    scheduler
        .set_profile(UserProfile::new(user_id, tier))
        .await
        .unwrap();
}

pub fn request(user_id: &str, agent_kind: &str, action: &str, payload: Value) -> SubmitRequest {
    SubmitRequest {
        user_id: user_id.to_string(),
        agent_kind: agent_kind.to_string(),
        action: action.to_string(),
        payload,
        rationale: None,
        confidence: None,
    }
}

pub async fn submit_accepted(scheduler: &Scheduler, req: SubmitRequest) -> Uuid {
    match scheduler.submit_task(req).await.unwrap() {
        SubmitOutcome::Accepted { task_id } => task_id,
        other => panic!("expected accepted, got {:?}", other),
    }
}

/// Poll the store until the task satisfies `done`
pub async fn wait_for_task<F>(scheduler: &Scheduler, id: Uuid, done: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    for _ in 0..MAX_POLLS {
        if let Some(task) = scheduler.get_task(id).await.unwrap() {
            if done(&task) {
                return task;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    let last = scheduler.get_task(id).await.unwrap();
    panic!("task {} never reached the expected state: {:?}", id, last);
}

pub async fn wait_for_phase(scheduler: &Scheduler, user_id: &str, phase: BrakePhase) {
    for _ in 0..MAX_POLLS {
        if scheduler.brake_state(user_id).phase == phase {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!(
        "brake for {} never reached {:?}: {:?}",
        user_id,
        phase,
        scheduler.brake_state(user_id)
    );
}

/// Event types recorded for one task, in append order
pub async fn task_events(scheduler: &Scheduler, user_id: &str, task_id: Uuid) -> Vec<String> {
    scheduler
        .store()
        .activity_since(user_id, 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.task_id == Some(task_id))
        .map(|e| e.event_type)
        .collect()
}
