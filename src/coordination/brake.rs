//! Emergency Brake
//!
//! Per-user pause/resume state machine:
//! - `pause` flips the flag before anything else, so the next checkpoint of
//!   every runner for that user sees it
//! - running tasks acknowledge at their checkpoint; the last one moves the
//!   phase to `paused`
//! - tasks that miss the acknowledgement window move the phase to `partial`
//!   and are handed back for force-termination
//! - `resume` returns the user to `running`
//!
//! Rows are persisted so a restart keeps a paused user paused.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BrakeConfig;
use crate::domain::{ActivityKind, BrakePhase, BrakeState, NewActivity};
use crate::error::Result;
use crate::events::ActivityPublisher;
use crate::persistence::Store;

/// Tasks that missed the acknowledgement window for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverduePause {
    pub user_id: String,
    pub task_ids: Vec<Uuid>,
}

pub struct BrakeRegistry {
    states: DashMap<String, BrakeState>,
    store: Arc<dyn Store>,
    publisher: ActivityPublisher,
    config: BrakeConfig,
}

impl BrakeRegistry {
    pub fn new(store: Arc<dyn Store>, publisher: ActivityPublisher, config: BrakeConfig) -> Self {
        Self {
            states: DashMap::new(),
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &BrakeConfig {
        &self.config
    }

    /// Fast check used at every checkpoint
    pub fn is_paused(&self, user_id: &str) -> bool {
        self.states.get(user_id).map_or(false, |s| s.paused)
    }

    /// Current state; absent rows read as running
    pub fn state(&self, user_id: &str) -> BrakeState {
        self.states
            .get(user_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| BrakeState::running(user_id))
    }

    /// Pause a user. `in_flight` are the tasks currently running for them.
    ///
    /// Pausing an already paused user returns the existing state unchanged.
    pub async fn pause(
        &self,
        user_id: &str,
        reason: Option<String>,
        in_flight: Vec<Uuid>,
    ) -> Result<BrakeState> {
        let now = Utc::now();
        let state = {
            let mut entry = self
                .states
                .entry(user_id.to_string())
                .or_insert_with(|| BrakeState::running(user_id));
            if entry.paused {
                return Ok(entry.clone());
            }
            entry.paused = true;
            entry.paused_at = Some(now);
            entry.reason = reason;
            entry.phase = if in_flight.is_empty() {
                BrakePhase::Paused
            } else {
                BrakePhase::Pausing
            };
            entry.awaiting = in_flight;
            entry.updated_at = now;
            entry.clone()
        };

        warn!(
            "Brake engaged for {} ({} running task(s)): {:?}",
            user_id,
            state.awaiting.len(),
            state.reason
        );
        self.store.put_brake(&state).await?;

        let kind = match state.phase {
            BrakePhase::Paused => ActivityKind::BrakePaused,
            _ => ActivityKind::BrakePausing,
        };
        self.publisher
            .emit(NewActivity::new(
                user_id,
                kind,
                json!({ "reason": state.reason, "awaiting": state.awaiting }),
            ))
            .await;

        Ok(state)
    }

    /// A running task reached a checkpoint under the brake, or stopped
    /// running for any other reason.
    pub async fn acknowledge(&self, user_id: &str, task_id: Uuid) -> Result<()> {
        let completed = {
            let mut entry = match self.states.get_mut(user_id) {
                Some(e) => e,
                None => return Ok(()),
            };
            if entry.phase != BrakePhase::Pausing {
                return Ok(());
            }
            let before = entry.awaiting.len();
            entry.awaiting.retain(|id| *id != task_id);
            if entry.awaiting.len() == before {
                return Ok(());
            }
            entry.updated_at = Utc::now();
            if entry.awaiting.is_empty() {
                entry.phase = BrakePhase::Paused;
            }
            entry.clone()
        };

        self.store.put_brake(&completed).await?;
        if completed.phase == BrakePhase::Paused {
            info!("All running tasks for {} reached a checkpoint", user_id);
            self.publisher
                .emit(NewActivity::new(
                    user_id,
                    ActivityKind::BrakePaused,
                    json!({ "reason": completed.reason }),
                ))
                .await;
        }
        Ok(())
    }

    /// Move a user still `pausing` from the pause engaged at `paused_at` to
    /// `partial`, once its acknowledgement window has run out.
    ///
    /// `paused_at` pins the pause the window was measured for, so a resume
    /// followed by a new pause is not cut short.
    pub async fn expire_pause(
        &self,
        user_id: &str,
        paused_at: Option<DateTime<Utc>>,
    ) -> Result<Option<OverduePause>> {
        let partial = {
            let mut entry = match self.states.get_mut(user_id) {
                Some(e) => e,
                None => return Ok(None),
            };
            if !entry.phase.can_transition_to(BrakePhase::Partial) || entry.paused_at != paused_at {
                return Ok(None);
            }
            let task_ids = std::mem::take(&mut entry.awaiting);
            entry.phase = BrakePhase::Partial;
            entry.updated_at = Utc::now();
            (entry.clone(), task_ids)
        };

        let (state, task_ids) = partial;
        warn!(
            "Brake for {} is partial: {} task(s) missed the {}s window",
            user_id,
            task_ids.len(),
            self.config.ack_window_secs
        );
        self.store.put_brake(&state).await?;
        self.publisher
            .emit(NewActivity::new(
                user_id,
                ActivityKind::BrakePartial,
                json!({ "task_ids": task_ids }),
            ))
            .await;

        Ok(Some(OverduePause {
            user_id: user_id.to_string(),
            task_ids,
        }))
    }

    /// Every pause whose window has elapsed at `now`
    pub async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<OverduePause>> {
        let window = self.config.ack_window();
        let due: Vec<(String, Option<DateTime<Utc>>)> = self
            .states
            .iter()
            .filter(|s| {
                s.phase == BrakePhase::Pausing
                    && s.paused_at.map_or(false, |at| now - at >= window)
            })
            .map(|s| (s.user_id.clone(), s.paused_at))
            .collect();

        let mut overdue = Vec::new();
        for (user_id, paused_at) in due {
            if let Some(o) = self.expire_pause(&user_id, paused_at).await? {
                overdue.push(o);
            }
        }
        Ok(overdue)
    }

    /// Clear the pause. Returns the state it replaced, or `None` if the user
    /// was not paused.
    pub async fn resume(&self, user_id: &str) -> Result<Option<BrakeState>> {
        let (previous, current) = {
            let mut entry = match self.states.get_mut(user_id) {
                Some(e) => e,
                None => return Ok(None),
            };
            if !entry.paused {
                return Ok(None);
            }
            let previous = entry.clone();
            *entry = BrakeState::running(user_id);
            (previous, entry.clone())
        };

        info!(
            "Brake released for {} (was {})",
            user_id, previous.phase
        );
        self.store.put_brake(&current).await?;
        self.publisher
            .emit(NewActivity::new(
                user_id,
                ActivityKind::BrakeResumed,
                json!({ "previous_phase": previous.phase }),
            ))
            .await;

        Ok(Some(previous))
    }

    /// Load persisted brake rows on startup
    pub async fn load_state(&self) -> Result<usize> {
        let rows = self.store.list_brakes().await?;
        let mut paused = 0;
        for row in rows {
            if row.paused {
                warn!(
                    "User {} is still paused from a previous session ({})",
                    row.user_id, row.phase
                );
                paused += 1;
            }
            self.states.insert(row.user_id.clone(), row);
        }
        Ok(paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn registry() -> (BrakeRegistry, ActivityPublisher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let publisher = ActivityPublisher::new(store.clone());
        (
            BrakeRegistry::new(store.clone(), publisher.clone(), BrakeConfig::default()),
            publisher,
            store,
        )
    }

    async fn event_types(store: &MemoryStore, user: &str) -> Vec<String> {
        store
            .activity_since(user, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_pause_with_nothing_running_goes_straight_to_paused() {
        let (brake, _, store) = registry();
        let state = brake.pause("u1", None, vec![]).await.unwrap();

        assert_eq!(state.phase, BrakePhase::Paused);
        assert!(brake.is_paused("u1"));
        assert_eq!(event_types(&store, "u1").await, vec!["brake.paused"]);
    }

    #[tokio::test]
    async fn test_pause_waits_for_every_acknowledgement() {
        let (brake, _, store) = registry();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let state = brake.pause("u1", Some("vacation".into()), vec![a, b]).await.unwrap();
        assert_eq!(state.phase, BrakePhase::Pausing);

        brake.acknowledge("u1", a).await.unwrap();
        assert_eq!(brake.state("u1").phase, BrakePhase::Pausing);
        brake.acknowledge("u1", b).await.unwrap();
        assert_eq!(brake.state("u1").phase, BrakePhase::Paused);

        assert_eq!(
            event_types(&store, "u1").await,
            vec!["brake.pausing", "brake.paused"]
        );
    }

    #[tokio::test]
    async fn test_missed_window_goes_partial() {
        let (brake, _, store) = registry();
        let stuck = Uuid::new_v4();
        let state = brake.pause("u1", None, vec![stuck]).await.unwrap();

        let early = state.paused_at.unwrap() + chrono::Duration::seconds(60);
        assert!(brake.overdue(early).await.unwrap().is_empty());

        let late = state.paused_at.unwrap() + chrono::Duration::seconds(121);
        let overdue = brake.overdue(late).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].task_ids, vec![stuck]);
        assert_eq!(brake.state("u1").phase, BrakePhase::Partial);
        assert!(event_types(&store, "u1")
            .await
            .contains(&"brake.partial".to_string()));
    }

    #[tokio::test]
    async fn test_window_expiry_leaves_acknowledged_pause_alone() {
        let (brake, _, store) = registry();
        let task = Uuid::new_v4();
        let state = brake.pause("u1", None, vec![task]).await.unwrap();
        brake.acknowledge("u1", task).await.unwrap();

        assert!(brake.expire_pause("u1", state.paused_at).await.unwrap().is_none());
        assert_eq!(brake.state("u1").phase, BrakePhase::Paused);
        assert!(!event_types(&store, "u1")
            .await
            .contains(&"brake.partial".to_string()));
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let (brake, _, store) = registry();
        brake.pause("u1", None, vec![]).await.unwrap();

        assert!(brake.resume("u1").await.unwrap().is_some());
        assert!(brake.resume("u1").await.unwrap().is_none());
        assert!(!brake.is_paused("u1"));

        let resumed = event_types(&store, "u1")
            .await
            .into_iter()
            .filter(|t| t == "brake.resumed")
            .count();
        assert_eq!(resumed, 1);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let (brake, publisher, store) = registry();
        brake.pause("u1", None, vec![]).await.unwrap();

        let reloaded = BrakeRegistry::new(store.clone(), publisher, BrakeConfig::default());
        assert_eq!(reloaded.load_state().await.unwrap(), 1);
        assert!(reloaded.is_paused("u1"));
    }
}
