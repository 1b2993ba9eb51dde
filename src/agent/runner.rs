//! Agent Runner
//!
//! Executes one attempt of a task under the soft/hard timeout policy with a
//! heartbeat ticker alongside, and classifies how it ended.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpoint::Checkpoint;
use super::output::AgentOutput;
use super::traits::{Agent, AgentError, AgentInput, Interrupt};
use crate::coordination::BrakeRegistry;
use crate::domain::{FailureKind, Task};
use crate::events::ActivityPublisher;
use crate::persistence::Store;

/// How one attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(AgentOutput),
    /// Stopped at a checkpoint because the user's brake is engaged
    Paused { partial: Option<Value> },
    Failed {
        kind: FailureKind,
        error: String,
        partial: Option<Value>,
    },
    /// Force-terminated through the kill token
    Killed { partial: Option<Value> },
}

enum Ended {
    Finished(Result<AgentOutput, AgentError>),
    HardTimeout,
    Killed,
}

#[derive(Clone)]
pub struct AgentRunner {
    brake: Arc<BrakeRegistry>,
    publisher: ActivityPublisher,
    store: Arc<dyn Store>,
    heartbeat_interval: Duration,
}

impl AgentRunner {
    pub fn new(
        brake: Arc<BrakeRegistry>,
        publisher: ActivityPublisher,
        store: Arc<dyn Store>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            brake,
            publisher,
            store,
            heartbeat_interval,
        }
    }

    fn spawn_heartbeat(&self, task: &Task) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let task_id = task.id;
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match store.touch_heartbeat(task_id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("Heartbeat for task {} failed: {}", task_id, e),
                }
            }
        })
    }

    /// Run one attempt of `task`, which must already be claimed as running
    pub async fn run(&self, agent: Arc<dyn Agent>, task: &Task, kill: CancellationToken) -> RunOutcome {
        let soft_timeout = CancellationToken::new();
        let mut checkpoint = Checkpoint::new(
            task.id,
            &task.user_id,
            self.brake.clone(),
            self.publisher.clone(),
            self.store.clone(),
            soft_timeout.clone(),
            kill.clone(),
            task.checkpoint.clone(),
        );

        if let Err(AgentError::Interrupted(interrupt)) = checkpoint.check() {
            let partial = checkpoint.into_partial();
            return match interrupt {
                Interrupt::Paused => RunOutcome::Paused { partial },
                _ => RunOutcome::Killed { partial },
            };
        }

        let input = AgentInput {
            task_id: task.id,
            user_id: task.user_id.clone(),
            action: task.action.clone(),
            payload: task.payload.clone(),
            attempt: task.attempt_count,
            resume_from: task.checkpoint.clone(),
        };

        let soft_timer = {
            let soft_timeout = soft_timeout.clone();
            let after = Duration::from_secs(task.soft_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                soft_timeout.cancel();
            })
        };
        let heartbeat = self.spawn_heartbeat(task);
        let hard_timeout = Duration::from_secs(task.hard_timeout_secs);

        let ended = {
            let attempt = agent.run(input, &mut checkpoint);
            tokio::select! {
                biased;
                _ = kill.cancelled() => Ended::Killed,
                result = tokio::time::timeout(hard_timeout, attempt) => match result {
                    Ok(r) => Ended::Finished(r),
                    Err(_) => Ended::HardTimeout,
                },
            }
        };

        soft_timer.abort();
        heartbeat.abort();
        let steps = checkpoint.steps();
        let partial = checkpoint.into_partial();
        debug!("Task {} attempt ended after {} step(s)", task.id, steps);

        match ended {
            Ended::Killed => RunOutcome::Killed { partial },
            Ended::HardTimeout => RunOutcome::Failed {
                kind: FailureKind::HardTimeout,
                error: format!("hard timeout after {}s", task.hard_timeout_secs),
                partial,
            },
            Ended::Finished(Ok(output)) => match output.validate() {
                Ok(()) => RunOutcome::Completed(output),
                Err(violation) => RunOutcome::Failed {
                    kind: FailureKind::Fatal,
                    error: format!("contract violation: {}", violation),
                    partial,
                },
            },
            Ended::Finished(Err(AgentError::Transient(error))) => RunOutcome::Failed {
                kind: FailureKind::Transient,
                error,
                partial,
            },
            Ended::Finished(Err(AgentError::Fatal(error))) => RunOutcome::Failed {
                kind: FailureKind::Fatal,
                error,
                partial,
            },
            Ended::Finished(Err(AgentError::Interrupted(Interrupt::Paused))) => {
                RunOutcome::Paused { partial }
            }
            Ended::Finished(Err(AgentError::Interrupted(Interrupt::SaveRequested))) => {
                RunOutcome::Failed {
                    kind: FailureKind::SoftTimeout,
                    error: format!(
                        "soft timeout after {}s, partial state saved",
                        task.soft_timeout_secs
                    ),
                    partial,
                }
            }
            Ended::Finished(Err(AgentError::Interrupted(Interrupt::Cancelled))) => {
                RunOutcome::Killed { partial }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ProbeAgent, Stepwise};
    use crate::config::BrakeConfig;
    use crate::domain::{TaskLimits, TaskState};
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn runner() -> (AgentRunner, Arc<BrakeRegistry>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let publisher = ActivityPublisher::new(store.clone());
        let brake = Arc::new(BrakeRegistry::new(
            store.clone(),
            publisher.clone(),
            BrakeConfig::default(),
        ));
        (
            AgentRunner::new(brake.clone(), publisher, store, Duration::from_secs(30)),
            brake,
        )
    }

    fn running_task(payload: Value) -> Task {
        let mut task = Task::new("u1", "probe", "probe", payload, TaskLimits::default());
        task.state = TaskState::Running;
        task
    }

    struct NoRationale;

    #[async_trait]
    impl Agent for NoRationale {
        fn kind(&self) -> &str {
            "lazy"
        }

        fn actions(&self) -> Vec<crate::autonomy::ActionSpec> {
            vec![crate::autonomy::ActionSpec::read("probe")]
        }

        async fn run(
            &self,
            input: AgentInput,
            _checkpoint: &mut Checkpoint,
        ) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::new(&input.action, "", 0.9))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Agent for Sleeper {
        fn kind(&self) -> &str {
            "sleeper"
        }

        fn actions(&self) -> Vec<crate::autonomy::ActionSpec> {
            vec![crate::autonomy::ActionSpec::read("probe")]
        }

        async fn run(
            &self,
            _input: AgentInput,
            _checkpoint: &mut Checkpoint,
        ) -> Result<AgentOutput, AgentError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(AgentError::Transient("woke up".into()))
        }
    }

    #[tokio::test]
    async fn test_probe_completes() {
        let (runner, _) = runner();
        let outcome = runner
            .run(
                Arc::new(Stepwise(ProbeAgent)),
                &running_task(json!({"steps": 2})),
                CancellationToken::new(),
            )
            .await;

        match outcome {
            RunOutcome::Completed(output) => {
                assert_eq!(output.data, json!({"visited": ["probe-1", "probe-2"]}));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_rationale_is_fatal() {
        let (runner, _) = runner();
        let outcome = runner
            .run(
                Arc::new(NoRationale),
                &running_task(json!({})),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: FailureKind::Fatal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_engaged_brake_stops_before_first_step() {
        let (runner, brake) = runner();
        brake.pause("u1", None, vec![]).await.unwrap();

        let outcome = runner
            .run(
                Arc::new(Stepwise(ProbeAgent)),
                &running_task(json!({})),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RunOutcome::Paused { partial: None });
    }

    #[tokio::test]
    async fn test_resumes_from_saved_partial() {
        let (runner, _) = runner();
        let mut task = running_task(json!({"steps": 3}));
        task.checkpoint = Some(json!({
            "completed_steps": 2,
            "state": {"visited": ["probe-1", "probe-2"]}
        }));

        match runner
            .run(Arc::new(Stepwise(ProbeAgent)), &task, CancellationToken::new())
            .await
        {
            RunOutcome::Completed(output) => {
                assert_eq!(
                    output.data,
                    json!({"visited": ["probe-1", "probe-2", "probe-3"]})
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_forces_failure() {
        let (runner, _) = runner();
        let outcome = runner
            .run(
                Arc::new(Sleeper),
                &running_task(json!({})),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: FailureKind::HardTimeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_timeout_saves_partial() {
        let (runner, _) = runner();
        // 70s steps; the soft timeout fires at 240s, so step 4 (280s) is the last
        let task = running_task(json!({"steps": 6, "step_delay_ms": 70_000}));
        match runner
            .run(Arc::new(Stepwise(ProbeAgent)), &task, CancellationToken::new())
            .await
        {
            RunOutcome::Failed {
                kind: FailureKind::SoftTimeout,
                partial: Some(partial),
                ..
            } => assert_eq!(partial["completed_steps"], json!(4)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_step_past_soft_timeout_completes() {
        let (runner, _) = runner();
        // The only step ends at 250s, after the soft timeout but before the hard one
        let task = running_task(json!({"steps": 1, "step_delay_ms": 250_000}));
        match runner
            .run(Arc::new(Stepwise(ProbeAgent)), &task, CancellationToken::new())
            .await
        {
            RunOutcome::Completed(output) => {
                assert_eq!(output.data, json!({"visited": ["probe-1"]}));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_token_terminates() {
        let (runner, _) = runner();
        let kill = CancellationToken::new();
        kill.cancel();

        let outcome = runner
            .run(Arc::new(Sleeper), &running_task(json!({})), kill)
            .await;
        assert!(matches!(outcome, RunOutcome::Killed { .. }));
    }
}
