//! Task Scheduler
//!
//! Owns the path from submission to a terminal state:
//! - `submit_task` runs the autonomy gate and persists accepted work
//! - one dispatcher per agent kind feeds a bounded worker pool
//! - a (user, agent kind) lane keeps conflicting work serial
//! - workers claim with a compare-and-set, so a task runs at most once
//!   even when it is enqueued twice
//! - finished attempts are finalized here: success, pause, retry with
//!   backoff, dead-letter, or cancellation by the brake
//!
//! The scheduler is a cheap `Clone` handle over shared state.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::lanes::{LaneKey, Lanes};
use super::retry::{RetryDecision, RetryPolicy};
use super::stats::{SchedulerCounters, SchedulerStats};
use crate::agent::{AgentRegistry, AgentRunner, RunOutcome};
use crate::approval::{ApprovalError, ApprovalQueue, BatchFailure, BatchOutcome, NewApproval};
use crate::autonomy::{
    violations, AutonomyGate, AutonomyTier, Decision, DecisionReason, GateRequest, TierTable,
};
use crate::config::{AppConfig, PartialPolicy, SchedulerConfig};
use crate::coordination::{BrakeRegistry, OverduePause};
use crate::domain::{
    ActivityKind, ApprovalDecision, ApprovalItem, ApprovalStatus, AttemptFailure, BrakePhase,
    BrakeState, DeadLetterRecord, FailureKind, NewActivity, Task, TaskLimits, TaskState,
    TaskTransition, UserProfile,
};
use crate::error::{JobPilotError, Result};
use crate::events::{ActivityPublisher, ActivityStream};
use crate::persistence::Store;

const MAX_USER_ID_LEN: usize = 128;

/// A request to run `action` on agent `agent_kind` for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub agent_kind: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    /// Shown to the user if the action is queued for approval
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Synchronous result of a submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Persisted and queued for a worker
    Accepted { task_id: Uuid },
    /// Persisted, but the user's brake is engaged; runs after resume
    Parked { task_id: Uuid },
    QueuedForApproval {
        approval_id: Uuid,
        reason: DecisionReason,
    },
    /// Nothing persisted; the caller may present the action as a suggestion
    Suggested { reason: DecisionReason },
    /// Nothing persisted
    Denied { reason: DecisionReason },
}

impl SubmitOutcome {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            SubmitOutcome::Accepted { task_id } | SubmitOutcome::Parked { task_id } => {
                Some(*task_id)
            }
            _ => None,
        }
    }
}

/// Result of approving an item: the item and the task it dispatched
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResolution {
    pub item: ApprovalItem,
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct QueuedTask {
    task_id: Uuid,
    lane: LaneKey,
}

/// Reject user ids that would break channel naming
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(JobPilotError::Validation("user_id is required".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(JobPilotError::Validation(format!(
            "user_id longer than {} characters",
            MAX_USER_ID_LEN
        )));
    }
    if user_id
        .chars()
        .any(|c| c == '.' || c == '*' || c.is_whitespace())
    {
        return Err(JobPilotError::Validation(
            "user_id may not contain '.', '*' or whitespace".into(),
        ));
    }
    Ok(())
}

struct Inner {
    config: SchedulerConfig,
    partial_policy: PartialPolicy,
    limits: TaskLimits,
    retry: RetryPolicy,
    store: Arc<dyn Store>,
    publisher: ActivityPublisher,
    brake: Arc<BrakeRegistry>,
    approvals: ApprovalQueue,
    gate: AutonomyGate,
    registry: AgentRegistry,
    runner: AgentRunner,
    queues: HashMap<String, mpsc::UnboundedSender<QueuedTask>>,
    receivers: Mutex<Option<Vec<(String, mpsc::UnboundedReceiver<QueuedTask>)>>>,
    pools: HashMap<String, Arc<Semaphore>>,
    lanes: Lanes,
    /// Kill tokens of attempts running on this node
    kill_switches: DashMap<Uuid, CancellationToken>,
    /// Retrying tasks with a backoff timer armed on this node
    retry_timers: DashSet<Uuid>,
    counters: SchedulerCounters,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: &AppConfig, store: Arc<dyn Store>, registry: AgentRegistry) -> Self {
        let publisher = ActivityPublisher::new(store.clone());
        let brake = Arc::new(BrakeRegistry::new(
            store.clone(),
            publisher.clone(),
            config.brake.clone(),
        ));
        let approvals = ApprovalQueue::new(store.clone(), publisher.clone(), config.approvals.ttl());
        let runner = AgentRunner::new(
            brake.clone(),
            publisher.clone(),
            store.clone(),
            config.scheduler.heartbeat_interval(),
        );

        let mut queues = HashMap::new();
        let mut receivers = Vec::new();
        let mut pools = HashMap::new();
        for kind in registry.kinds() {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(kind.clone(), tx);
            pools.insert(
                kind.clone(),
                Arc::new(Semaphore::new(config.scheduler.worker_pool_size.max(1))),
            );
            receivers.push((kind, rx));
        }

        Self {
            inner: Arc::new(Inner {
                config: config.scheduler.clone(),
                partial_policy: config.brake.partial_policy,
                limits: TaskLimits {
                    max_attempts: config.scheduler.max_attempts,
                    soft_timeout_secs: config.scheduler.soft_timeout_secs,
                    hard_timeout_secs: config.scheduler.hard_timeout_secs,
                },
                retry: RetryPolicy::from_config(&config.scheduler),
                store,
                publisher,
                brake,
                approvals,
                gate: AutonomyGate::new(TierTable::from_config(&config.autonomy)),
                registry,
                runner,
                queues,
                receivers: Mutex::new(Some(receivers)),
                pools,
                lanes: Lanes::new(),
                kill_switches: DashMap::new(),
                retry_timers: DashSet::new(),
                counters: SchedulerCounters::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn publisher(&self) -> &ActivityPublisher {
        &self.inner.publisher
    }

    pub fn brake(&self) -> &Arc<BrakeRegistry> {
        &self.inner.brake
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.inner.approvals
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner
            .counters
            .snapshot(self.inner.kill_switches.len(), self.inner.lanes.backlog())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // ==================== Lifecycle ====================

    /// Spawn the dispatchers and requeue work left by a previous process
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let receivers = self
            .inner
            .receivers
            .lock()
            .await
            .take()
            .ok_or_else(|| JobPilotError::Internal("scheduler already started".into()))?;

        let handles = receivers
            .into_iter()
            .map(|(kind, rx)| tokio::spawn(self.clone().dispatch_loop(kind, rx)))
            .collect();

        self.recover().await?;
        Ok(handles)
    }

    /// Stop dispatching and cancel pending retry timers. Running attempts
    /// finish on their own.
    pub fn shutdown(&self) {
        info!("Scheduler shutting down ({})", self.stats());
        self.inner.shutdown.cancel();
    }

    async fn recover(&self) -> Result<()> {
        let paused_users = self.inner.brake.load_state().await?;
        let now = Utc::now();

        let accepted = self
            .inner
            .store
            .list_tasks_by_state(TaskState::Accepted)
            .await?;
        for task in &accepted {
            self.enqueue(task);
        }

        let retrying = self
            .inner
            .store
            .list_tasks_by_state(TaskState::Retrying)
            .await?;
        for task in &retrying {
            let remaining = task
                .next_attempt_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.schedule_retry(task, remaining);
        }

        let mut paused_tasks = 0;
        for task in self
            .inner
            .store
            .list_tasks_by_state(TaskState::Running)
            .await?
        {
            if task.paused {
                self.enqueue(&task);
                paused_tasks += 1;
            }
        }

        info!(
            "Recovered {} accepted, {} retrying, {} paused task(s); {} user(s) paused",
            accepted.len(),
            retrying.len(),
            paused_tasks,
            paused_users
        );
        Ok(())
    }

    // ==================== Submission ====================

    /// Gate a request and, if it may run, persist and queue it
    #[instrument(skip(self, req), fields(user = %req.user_id, agent = %req.agent_kind, action = %req.action))]
    pub async fn submit_task(&self, req: SubmitRequest) -> Result<SubmitOutcome> {
        validate_user_id(&req.user_id)?;
        let agent = self.inner.registry.get(&req.agent_kind).ok_or_else(|| {
            JobPilotError::Validation(format!("unknown agent kind '{}'", req.agent_kind))
        })?;
        if let Some(confidence) = req.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(JobPilotError::Validation(
                    "confidence must be within [0, 1]".into(),
                ));
            }
        }

        let spec = self.inner.registry.action(&req.agent_kind, &req.action);
        if spec.is_some() {
            agent
                .validate_payload(&req.action, &req.payload)
                .map_err(JobPilotError::Validation)?;
        }

        let profile = self.inner.store.get_profile(&req.user_id).await?;
        let violated = profile
            .as_ref()
            .map(|p| violations(&p.deal_breakers, &req.payload))
            .unwrap_or_default();
        let today = Utc::now().date_naive();
        let used = self.inner.store.daily_actions(&req.user_id, today).await?;

        let verdict = self.inner.gate.decide(&GateRequest {
            tier: profile.as_ref().map(|p| p.tier.as_str()),
            action_name: &req.action,
            action: spec.as_ref(),
            violations: &violated,
            actions_today: used,
        });
        debug!("Gate: {} ({})", verdict.decision.as_str(), verdict.reason);

        match verdict.decision {
            Decision::Execute => {
                let is_write = spec.as_ref().map_or(false, |s| s.is_write);
                let cap = profile
                    .as_ref()
                    .and_then(|p| AutonomyTier::parse(&p.tier))
                    .and_then(|t| self.inner.gate.table().get(t))
                    .and_then(|c| c.daily_action_cap);
                if let (true, Some(cap)) = (is_write, cap) {
                    let consumed = self
                        .inner
                        .store
                        .try_consume_daily_action(&req.user_id, today, cap)
                        .await?;
                    if !consumed {
                        let reason = DecisionReason::DailyCapReached { cap, used: cap };
                        return self.queue_for_approval(req, reason).await;
                    }
                }
                let task = Task::new(
                    &req.user_id,
                    &req.agent_kind,
                    &req.action,
                    req.payload,
                    self.inner.limits,
                );
                self.accept(task).await
            }
            Decision::QueueForApproval => self.queue_for_approval(req, verdict.reason).await,
            Decision::Suggest => {
                info!("Suggesting instead of executing: {}", verdict.reason);
                Ok(SubmitOutcome::Suggested {
                    reason: verdict.reason,
                })
            }
            Decision::Deny => {
                info!("Denied: {}", verdict.reason);
                Ok(SubmitOutcome::Denied {
                    reason: verdict.reason,
                })
            }
        }
    }

    async fn queue_for_approval(
        &self,
        req: SubmitRequest,
        reason: DecisionReason,
    ) -> Result<SubmitOutcome> {
        let rationale = req
            .rationale
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| reason.to_string());
        let item = self
            .inner
            .approvals
            .create(NewApproval {
                user_id: req.user_id,
                agent_kind: req.agent_kind,
                action_name: req.action,
                payload: req.payload,
                rationale,
                confidence: req.confidence,
            })
            .await
            .map_err(approval_store_error)?;
        Ok(SubmitOutcome::QueuedForApproval {
            approval_id: item.id,
            reason,
        })
    }

    /// Persist a task and hand it to its dispatcher
    async fn accept(&self, task: Task) -> Result<SubmitOutcome> {
        self.inner.store.insert_task(&task).await?;
        self.inner.counters.record_submitted();
        self.inner
            .publisher
            .emit(
                NewActivity::new(
                    &task.user_id,
                    ActivityKind::TaskAccepted,
                    json!({
                        "agent_kind": task.agent_kind,
                        "action": task.action,
                        "approval_id": task.approval_id,
                    }),
                )
                .for_task(task.id),
            )
            .await;

        if self.inner.brake.is_paused(&task.user_id) {
            self.publish_parked(&task).await;
            return Ok(SubmitOutcome::Parked { task_id: task.id });
        }
        self.enqueue(&task);
        Ok(SubmitOutcome::Accepted { task_id: task.id })
    }

    async fn publish_parked(&self, task: &Task) {
        info!("Task {} parked: user {} is paused", task.id, task.user_id);
        self.inner
            .publisher
            .emit(
                NewActivity::new(
                    &task.user_id,
                    ActivityKind::TaskParked,
                    json!({ "state": task.state }),
                )
                .for_task(task.id),
            )
            .await;
    }

    fn enqueue(&self, task: &Task) {
        match self.inner.queues.get(&task.agent_kind) {
            Some(tx) => {
                let queued = QueuedTask {
                    task_id: task.id,
                    lane: task.lane(),
                };
                if tx.send(queued).is_err() {
                    warn!("Dispatcher for '{}' is gone, task {} not queued", task.agent_kind, task.id);
                }
            }
            None => warn!(
                "No dispatcher for agent kind '{}', task {} left {}",
                task.agent_kind, task.id, task.state
            ),
        }
    }

    // ==================== Dispatch ====================

    async fn dispatch_loop(self, kind: String, mut rx: mpsc::UnboundedReceiver<QueuedTask>) {
        info!("Dispatcher for '{}' started", kind);
        loop {
            let queued = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(q) => q,
                    None => break,
                },
            };

            let lane = queued.lane;
            if self.inner.lanes.try_acquire(lane.clone(), queued.task_id) {
                self.spawn_lane(queued.task_id, lane);
            } else {
                debug!("Task {} waiting for lane {:?}", queued.task_id, lane);
            }
        }
        info!("Dispatcher for '{}' stopped", kind);
    }

    /// Drive a lane until its backlog is empty
    fn spawn_lane(&self, first: Uuid, lane: LaneKey) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(task_id) = next {
                this.run_with_permit(task_id, &lane.1).await;
                next = this.inner.lanes.release(&lane);
            }
        });
    }

    async fn run_with_permit(&self, task_id: Uuid, kind: &str) {
        let pool = match self.inner.pools.get(kind) {
            Some(p) => p.clone(),
            None => return,
        };
        let _permit = match pool.acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Err(e) = self.attempt(task_id).await {
            error!("Task {} attempt could not be finalized: {}", task_id, e);
        }
    }

    /// Claim and run one attempt of a task
    #[instrument(skip(self))]
    async fn attempt(&self, task_id: Uuid) -> Result<()> {
        let task = match self.inner.store.get_task(task_id).await? {
            Some(t) => t,
            None => return Ok(()),
        };
        if task.state.is_terminal() {
            return Ok(());
        }

        if self.inner.brake.is_paused(&task.user_id) {
            if task.state.is_claimable() {
                self.publish_parked(&task).await;
            }
            return Ok(());
        }

        let now = Utc::now();
        let claim = match task.state {
            TaskState::Accepted | TaskState::Retrying => {
                TaskTransition::new(task.state, TaskState::Running)
                    .heartbeat(now)
                    .next_attempt_at(None)
            }
            TaskState::Running if task.paused => {
                TaskTransition::new(TaskState::Running, TaskState::Running)
                    .expect_paused(true)
                    .paused(false)
                    .heartbeat(now)
            }
            _ => return Ok(()),
        };
        let resumed = task.paused;
        let claimed = match self.inner.store.transition_task(task_id, &claim).await? {
            Some(t) => t,
            None => {
                debug!("Task {} already claimed", task_id);
                return Ok(());
            }
        };

        self.inner
            .publisher
            .emit(
                NewActivity::new(
                    &claimed.user_id,
                    ActivityKind::TaskRunning,
                    json!({
                        "attempt": claimed.attempt_count + 1,
                        "resumed": resumed,
                    }),
                )
                .for_task(task_id),
            )
            .await;

        let agent = match self.inner.registry.get(&claimed.agent_kind) {
            Some(a) => a,
            None => {
                let error = format!("no agent registered for kind '{}'", claimed.agent_kind);
                self.fail_task(&claimed, FailureKind::Fatal, error, None)
                    .await?;
                return Ok(());
            }
        };

        let kill = CancellationToken::new();
        self.inner.kill_switches.insert(task_id, kill.clone());
        let outcome = self.inner.runner.run(agent, &claimed, kill).await;
        self.inner.kill_switches.remove(&task_id);

        let finished = self.finish(&claimed, outcome).await;
        if let Err(e) = self
            .inner
            .brake
            .acknowledge(&claimed.user_id, task_id)
            .await
        {
            warn!("Brake acknowledgement for task {} failed: {}", task_id, e);
        }
        finished
    }

    async fn finish(&self, task: &Task, outcome: RunOutcome) -> Result<()> {
        match outcome {
            RunOutcome::Completed(output) => {
                let transition = TaskTransition::new(TaskState::Running, TaskState::Succeeded)
                    .expect_paused(false)
                    .checkpoint(None)
                    .result(serde_json::to_value(&output)?);
                match self.inner.store.transition_task(task.id, &transition).await? {
                    Some(done) => {
                        self.inner.counters.record_succeeded();
                        info!("Task {} succeeded", task.id);
                        self.inner
                            .publisher
                            .emit(
                                NewActivity::new(
                                    &done.user_id,
                                    ActivityKind::TaskSucceeded,
                                    json!({
                                        "action": output.action,
                                        "rationale": output.rationale,
                                        "confidence": output.confidence,
                                        "attempt_count": done.attempt_count,
                                    }),
                                )
                                .for_task(task.id),
                            )
                            .await;
                    }
                    None => warn!("Task {} left running before its result was saved", task.id),
                }
            }
            RunOutcome::Paused { partial } => {
                let mut transition = TaskTransition::new(TaskState::Running, TaskState::Running)
                    .expect_paused(false)
                    .paused(true);
                if partial.is_some() {
                    transition = transition.checkpoint(partial);
                }
                if let Some(paused) = self.inner.store.transition_task(task.id, &transition).await? {
                    info!("Task {} paused at a checkpoint", task.id);
                    self.inner
                        .publisher
                        .emit(
                            NewActivity::new(
                                &paused.user_id,
                                ActivityKind::TaskPaused,
                                json!({ "checkpoint": paused.checkpoint.is_some() }),
                            )
                            .for_task(task.id),
                        )
                        .await;
                }
            }
            RunOutcome::Failed {
                kind,
                error,
                partial,
            } => {
                self.fail_task(task, kind, error, partial).await?;
            }
            RunOutcome::Killed { partial } => {
                self.cancel_task(task, partial, "force-terminated").await?;
            }
        }
        Ok(())
    }

    /// Record a failed attempt, then retry or dead-letter. Returns false if
    /// the task was no longer running.
    pub(crate) async fn fail_task(
        &self,
        task: &Task,
        kind: FailureKind,
        error: String,
        partial: Option<Value>,
    ) -> Result<bool> {
        let now = Utc::now();
        let attempt_count = task.attempt_count + 1;
        let decision = self
            .inner
            .retry
            .decide(kind, attempt_count, task.max_attempts);

        let failure = AttemptFailure {
            attempt: attempt_count,
            kind,
            error: error.clone(),
            retry_delay_secs: decision.delay().map(|d| d.as_secs()),
            at: now,
        };
        let mut transition = TaskTransition::new(TaskState::Running, TaskState::Failed)
            .expect_paused(false)
            .attempt_count(attempt_count)
            .failure(failure);
        if partial.is_some() {
            transition = transition.checkpoint(partial);
        }
        let failed = match self.inner.store.transition_task(task.id, &transition).await? {
            Some(t) => t,
            None => return Ok(false),
        };

        warn!(
            "Task {} attempt {}/{} failed ({:?}): {}",
            task.id, attempt_count, task.max_attempts, kind, error
        );
        self.inner
            .publisher
            .emit(
                NewActivity::new(
                    &failed.user_id,
                    ActivityKind::TaskFailed,
                    json!({ "attempt": attempt_count, "kind": kind, "error": error }),
                )
                .for_task(task.id),
            )
            .await;

        match decision {
            RetryDecision::Retry { delay } => {
                let next_attempt_at = now
                    + chrono::Duration::from_std(delay)
                        .map_err(|e| JobPilotError::Internal(e.to_string()))?;
                let transition = TaskTransition::new(TaskState::Failed, TaskState::Retrying)
                    .next_attempt_at(Some(next_attempt_at));
                if let Some(retrying) = self.inner.store.transition_task(task.id, &transition).await? {
                    self.inner.counters.record_retried();
                    self.inner
                        .publisher
                        .emit(
                            NewActivity::new(
                                &retrying.user_id,
                                ActivityKind::TaskRetrying,
                                json!({
                                    "attempt_count": retrying.attempt_count,
                                    "delay_secs": delay.as_secs(),
                                    "next_attempt_at": next_attempt_at,
                                }),
                            )
                            .for_task(task.id),
                        )
                        .await;
                    self.schedule_retry(&retrying, delay);
                }
            }
            RetryDecision::DeadLetter => {
                let transition = TaskTransition::new(TaskState::Failed, TaskState::DeadLettered);
                if let Some(dead) = self.inner.store.transition_task(task.id, &transition).await? {
                    let record = DeadLetterRecord::from_task(&dead);
                    self.inner.store.insert_dead_letter(&record).await?;
                    self.inner.counters.record_dead_lettered();
                    error!(
                        "Task {} dead-lettered after {} attempt(s): {}",
                        task.id, dead.attempt_count, record.final_error
                    );
                    self.inner
                        .publisher
                        .emit(
                            NewActivity::new(
                                &dead.user_id,
                                ActivityKind::TaskDeadLettered,
                                json!({
                                    "attempt_count": dead.attempt_count,
                                    "final_error": record.final_error,
                                }),
                            )
                            .for_task(task.id),
                        )
                        .await;
                }
            }
        }
        Ok(true)
    }

    fn schedule_retry(&self, task: &Task, delay: Duration) {
        if !self.inner.retry_timers.insert(task.id) {
            return;
        }
        let this = self.clone();
        let task = task.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    this.inner.retry_timers.remove(&task.id);
                    this.enqueue(&task);
                }
            }
        });
    }

    /// Running → cancelled, keeping or dropping partial state per policy
    async fn cancel_task(&self, task: &Task, partial: Option<Value>, reason: &str) -> Result<bool> {
        let checkpoint = match self.inner.partial_policy {
            PartialPolicy::Persist => partial.or_else(|| task.checkpoint.clone()),
            PartialPolicy::Discard => None,
        };
        let kept = checkpoint.is_some();
        let transition =
            TaskTransition::new(TaskState::Running, TaskState::Cancelled).checkpoint(checkpoint);
        let cancelled = match self.inner.store.transition_task(task.id, &transition).await? {
            Some(t) => t,
            None => return Ok(false),
        };

        self.inner.counters.record_cancelled();
        warn!("Task {} cancelled: {}", task.id, reason);
        self.inner
            .publisher
            .emit(
                NewActivity::new(
                    &cancelled.user_id,
                    ActivityKind::TaskCancelled,
                    json!({ "reason": reason, "checkpoint_kept": kept }),
                )
                .for_task(task.id),
            )
            .await;
        Ok(true)
    }

    // ==================== Brake ====================

    /// Engage the user's brake. Running tasks stop at their next checkpoint;
    /// those that miss the acknowledgement window are force-terminated.
    #[instrument(skip(self, reason))]
    pub async fn pause(&self, user_id: &str, reason: Option<String>) -> Result<BrakeState> {
        validate_user_id(user_id)?;
        let in_flight: Vec<Uuid> = self
            .inner
            .store
            .list_user_tasks(user_id, Some(TaskState::Running))
            .await?
            .into_iter()
            .filter(|t| !t.paused)
            .map(|t| t.id)
            .collect();

        self.inner.brake.pause(user_id, reason, in_flight).await?;
        self.settle_awaiting(user_id).await?;

        let state = self.inner.brake.state(user_id);
        if state.phase == BrakePhase::Pausing {
            self.watch_ack_window(user_id, state.paused_at);
        }
        Ok(state)
    }

    /// Acknowledge awaited tasks that stopped running between the snapshot
    /// and the brake engaging; their own acknowledgement came too early.
    pub(crate) async fn settle_awaiting(&self, user_id: &str) -> Result<()> {
        for task_id in self.inner.brake.state(user_id).awaiting {
            let still_running = matches!(
                self.inner.store.get_task(task_id).await?,
                Some(task) if task.state == TaskState::Running && !task.paused
            );
            if !still_running {
                debug!("Task {} stopped before the brake engaged", task_id);
                self.inner.brake.acknowledge(user_id, task_id).await?;
            }
        }
        Ok(())
    }

    fn watch_ack_window(&self, user_id: &str, paused_at: Option<DateTime<Utc>>) {
        let this = self.clone();
        let user_id = user_id.to_string();
        let window = Duration::from_secs(self.inner.brake.config().ack_window_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    match this.inner.brake.expire_pause(&user_id, paused_at).await {
                        Ok(Some(overdue)) => this.force_terminate(overdue).await,
                        Ok(None) => {}
                        Err(e) => error!("Brake window check for {} failed: {}", user_id, e),
                    }
                }
            }
        });
    }

    /// Cancel tasks that never reached a checkpoint under the brake
    pub(crate) async fn force_terminate(&self, overdue: OverduePause) {
        for task_id in overdue.task_ids {
            if let Some(kill) = self.inner.kill_switches.get(&task_id) {
                kill.cancel();
                continue;
            }
            // Not running here: the owning worker is gone, cancel the row
            match self.inner.store.get_task(task_id).await {
                Ok(Some(task)) if task.state == TaskState::Running => {
                    if let Err(e) = self.cancel_task(&task, None, "brake window missed").await {
                        error!("Failed to cancel task {}: {}", task_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => error!("Failed to load task {}: {}", task_id, e),
            }
        }
    }

    /// Release the user's brake and requeue their parked and paused work.
    /// Resuming a user who is not paused changes nothing.
    #[instrument(skip(self))]
    pub async fn resume(&self, user_id: &str) -> Result<BrakeState> {
        validate_user_id(user_id)?;
        if self.inner.brake.resume(user_id).await?.is_none() {
            return Ok(self.inner.brake.state(user_id));
        }

        let mut requeued = 0;
        for task in self.inner.store.list_user_tasks(user_id, None).await? {
            let due = match task.state {
                TaskState::Accepted => true,
                TaskState::Running => task.paused,
                TaskState::Retrying => !self.inner.retry_timers.contains(&task.id),
                _ => false,
            };
            if due {
                self.enqueue(&task);
                requeued += 1;
            }
        }
        info!("Requeued {} task(s) for {}", requeued, user_id);
        Ok(self.inner.brake.state(user_id))
    }

    pub fn brake_state(&self, user_id: &str) -> BrakeState {
        self.inner.brake.state(user_id)
    }

    // ==================== Approvals ====================

    pub async fn resolve_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> std::result::Result<ApprovalResolution, ApprovalError> {
        match decision {
            ApprovalDecision::Approved => self.approve(id).await,
            ApprovalDecision::Rejected { reason } => {
                let item = self.inner.approvals.reject(id, reason).await?;
                Ok(ApprovalResolution {
                    item,
                    task_id: None,
                })
            }
        }
    }

    /// Approve and dispatch. Concurrent approvals of one item dispatch once.
    #[instrument(skip(self))]
    pub async fn approve(&self, id: Uuid) -> std::result::Result<ApprovalResolution, ApprovalError> {
        let item = self.inner.approvals.approve(id).await?;
        let task_id = self.dispatch_approved(&item).await?;
        Ok(ApprovalResolution {
            item,
            task_id: Some(task_id),
        })
    }

    pub async fn reject(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> std::result::Result<ApprovalItem, ApprovalError> {
        self.inner.approvals.reject(id, reason).await
    }

    /// Approve several items; each success dispatches its task
    pub async fn batch_approve(&self, ids: &[Uuid]) -> BatchOutcome {
        let mut outcome = self.inner.approvals.batch_approve(ids).await;
        let mut dispatched = Vec::with_capacity(outcome.approved.len());
        for mut item in std::mem::take(&mut outcome.approved) {
            match self.dispatch_approved(&item).await {
                Ok(task_id) => {
                    item.task_id = Some(task_id);
                    dispatched.push(item);
                }
                Err(e) => {
                    // Approved but not dispatched; the sweep reconciles it
                    error!("Dispatch of approval {} failed: {}", item.id, e);
                    outcome.failed.push(BatchFailure {
                        id: item.id,
                        error: e.to_string(),
                        current_status: Some(ApprovalStatus::Approved),
                    });
                }
            }
        }
        outcome.approved = dispatched;
        outcome
    }

    /// Create the task for an approved item, or find the one already created
    async fn dispatch_approved(&self, item: &ApprovalItem) -> Result<Uuid> {
        if let Some(existing) = self.inner.store.find_task_by_approval(item.id).await? {
            self.inner
                .store
                .attach_approval_task(item.id, existing.id)
                .await?;
            return Ok(existing.id);
        }

        let task = Task::new(
            &item.user_id,
            &item.agent_kind,
            &item.action_name,
            item.payload.clone(),
            self.inner.limits,
        )
        .with_approval(item.id);
        let task_id = task.id;

        match self.accept(task).await {
            Ok(_) => {}
            Err(JobPilotError::Conflict(_)) => {
                let existing = self
                    .inner
                    .store
                    .find_task_by_approval(item.id)
                    .await?
                    .ok_or_else(|| {
                        JobPilotError::Internal(format!("approval {} lost its task", item.id))
                    })?;
                self.inner
                    .store
                    .attach_approval_task(item.id, existing.id)
                    .await?;
                return Ok(existing.id);
            }
            Err(e) => return Err(e),
        }

        self.inner
            .store
            .attach_approval_task(item.id, task_id)
            .await?;
        info!("Approval {} dispatched as task {}", item.id, task_id);
        Ok(task_id)
    }

    pub async fn list_approvals(
        &self,
        user_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>> {
        Ok(self.inner.store.list_approvals(user_id, status).await?)
    }

    /// Pending items for a user
    pub async fn count_approvals(&self, user_id: &str) -> Result<u64> {
        self.inner
            .store
            .count_approvals(user_id, ApprovalStatus::Pending)
            .await
    }

    // ==================== Sweep hooks ====================

    /// Fail running tasks whose heartbeat went stale
    pub(crate) async fn reap_zombies(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = self.inner.config.zombie_threshold();
        let mut reaped = 0;
        for task in self
            .inner
            .store
            .list_tasks_by_state(TaskState::Running)
            .await?
        {
            if !task.is_stale(now, threshold) {
                continue;
            }
            let last = task.last_heartbeat_at.unwrap_or(task.updated_at);
            let error = format!("no heartbeat since {}", last.to_rfc3339());
            if self
                .fail_task(&task, FailureKind::Zombie, error, None)
                .await?
            {
                reaped += 1;
                self.inner.counters.record_zombie();
                if let Some(kill) = self.inner.kill_switches.get(&task.id) {
                    kill.cancel();
                }
                if let Err(e) = self.inner.brake.acknowledge(&task.user_id, task.id).await {
                    warn!("Brake acknowledgement for task {} failed: {}", task.id, e);
                }
            }
        }
        Ok(reaped)
    }

    /// Dispatch approved items that never got a task
    pub(crate) async fn reconcile_approvals(&self) -> Result<usize> {
        let mut reconciled = 0;
        for item in self.inner.store.list_undispatched_approvals().await? {
            let task_id = self.dispatch_approved(&item).await?;
            warn!("Reconciled approval {} with task {}", item.id, task_id);
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Force-terminate tasks behind brakes whose window elapsed at `now`
    pub(crate) async fn enforce_brake_windows(&self, now: DateTime<Utc>) -> Result<usize> {
        let overdue = self.inner.brake.overdue(now).await?;
        let count = overdue.len();
        for o in overdue {
            self.force_terminate(o).await;
        }
        Ok(count)
    }

    /// Delete terminal tasks older than the retention window
    pub(crate) async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        if self.inner.config.retention_days == 0 {
            return Ok(0);
        }
        let before = now - chrono::Duration::days(i64::from(self.inner.config.retention_days));
        self.inner.store.purge_terminal_tasks(before).await
    }

    // ==================== Queries ====================

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.inner.store.get_task(id).await
    }

    pub async fn get_task_status(&self, id: Uuid) -> Result<Task> {
        self.inner
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| JobPilotError::NotFound(format!("task {}", id)))
    }

    pub async fn list_user_tasks(&self, user_id: &str, state: Option<TaskState>) -> Result<Vec<Task>> {
        self.inner.store.list_user_tasks(user_id, state).await
    }

    pub async fn list_dead_lettered(&self, agent_kind: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        self.inner.store.list_dead_letters(agent_kind).await
    }

    /// Replay events after `since`, then follow live
    pub async fn stream_activity(&self, user_id: &str, since: i64) -> Result<ActivityStream> {
        validate_user_id(user_id)?;
        ActivityStream::open(self.inner.publisher.clone(), user_id, since).await
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.inner.store.get_profile(user_id).await
    }

    pub async fn set_profile(&self, mut profile: UserProfile) -> Result<UserProfile> {
        validate_user_id(&profile.user_id)?;
        let tier = AutonomyTier::parse(&profile.tier).ok_or_else(|| {
            JobPilotError::Validation(format!("unknown autonomy tier '{}'", profile.tier))
        })?;
        profile.tier = tier.as_str().to_string();
        profile.updated_at = Utc::now();
        self.inner.store.put_profile(&profile).await?;
        info!("Profile for {} set to tier {}", profile.user_id, profile.tier);
        Ok(profile)
    }
}

fn approval_store_error(e: ApprovalError) -> JobPilotError {
    match e {
        ApprovalError::Store(inner) => inner,
        other => JobPilotError::Internal(other.to_string()),
    }
}
