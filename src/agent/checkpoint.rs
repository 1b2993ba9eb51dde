//! Checkpoint handle passed to agents
//!
//! Before each step an agent calls `check`, which stops it on a kill, an
//! engaged brake or an elapsed soft timeout. After each step it calls
//! `reached`, which emits a `task.step` event and refreshes the heartbeat.
//! Nothing is checked after the last step, so finished work is never lost.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{AgentError, Interrupt};
use crate::coordination::BrakeRegistry;
use crate::domain::{ActivityKind, NewActivity};
use crate::events::ActivityPublisher;
use crate::persistence::Store;

pub struct Checkpoint {
    task_id: Uuid,
    user_id: String,
    brake: Arc<BrakeRegistry>,
    publisher: ActivityPublisher,
    store: Arc<dyn Store>,
    soft_timeout: CancellationToken,
    kill: CancellationToken,
    steps: u32,
    partial: Option<Value>,
}

impl Checkpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: Uuid,
        user_id: &str,
        brake: Arc<BrakeRegistry>,
        publisher: ActivityPublisher,
        store: Arc<dyn Store>,
        soft_timeout: CancellationToken,
        kill: CancellationToken,
        resume_from: Option<Value>,
    ) -> Self {
        Self {
            task_id,
            user_id: user_id.to_string(),
            brake,
            publisher,
            store,
            soft_timeout,
            kill,
            steps: 0,
            partial: resume_from,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Steps reported during this attempt
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Last partial state reported (or the one resumed from)
    pub fn partial(&self) -> Option<&Value> {
        self.partial.as_ref()
    }

    pub fn into_partial(self) -> Option<Value> {
        self.partial
    }

    /// Whether the agent may start another step
    pub fn check(&self) -> Result<(), AgentError> {
        if self.kill.is_cancelled() {
            return Err(AgentError::Interrupted(Interrupt::Cancelled));
        }
        if self.brake.is_paused(&self.user_id) {
            debug!("Task {} stopping at checkpoint: brake engaged", self.task_id);
            return Err(AgentError::Interrupted(Interrupt::Paused));
        }
        if self.soft_timeout.is_cancelled() {
            debug!("Task {} stopping at checkpoint: soft timeout", self.task_id);
            return Err(AgentError::Interrupted(Interrupt::SaveRequested));
        }
        Ok(())
    }

    /// Report a finished step with the partial state needed to resume after it
    pub async fn reached(&mut self, step: &str, partial: Value) {
        self.steps += 1;
        self.partial = Some(partial.clone());

        self.publisher
            .emit(
                NewActivity::new(
                    &self.user_id,
                    ActivityKind::TaskStep,
                    json!({ "step": step, "index": self.steps, "partial": partial }),
                )
                .for_task(self.task_id),
            )
            .await;

        if let Err(e) = self.store.touch_heartbeat(self.task_id, Utc::now()).await {
            warn!("Heartbeat refresh failed for task {}: {}", self.task_id, e);
        }
    }
}
