//! In-memory store
//!
//! Every conditional update runs under the owning `DashMap` entry lock, so a
//! check and its write are atomic per row.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use super::{ensure_allowed, ApprovalUpdate, Store};
use crate::domain::{
    ActivityEvent, ApprovalItem, ApprovalStatus, BrakeState, DeadLetterRecord, NewActivity, Task,
    TaskState, TaskTransition, UserProfile,
};
use crate::error::{JobPilotError, Result};

#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<Uuid, Task>,
    /// approval id → dispatched task id
    approval_tasks: DashMap<Uuid, Uuid>,
    approvals: DashMap<Uuid, ApprovalItem>,
    activity: DashMap<String, Vec<ActivityEvent>>,
    activity_seq: AtomicI64,
    dead_letters: DashMap<Uuid, DeadLetterRecord>,
    brakes: DashMap<String, BrakeState>,
    profiles: DashMap<String, UserProfile>,
    daily_counts: DashMap<(String, NaiveDate), u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_tasks(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|t| t.created_at);
    tasks
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(JobPilotError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }

        if let Some(approval_id) = task.approval_id {
            match self.approval_tasks.entry(approval_id) {
                Entry::Occupied(existing) => {
                    return Err(JobPilotError::Conflict(format!(
                        "approval {} already dispatched task {}",
                        approval_id,
                        existing.get()
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(task.id);
                }
            }
        }

        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn transition_task(
        &self,
        id: Uuid,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        ensure_allowed(transition)?;

        match self.tasks.get_mut(&id) {
            Some(mut task) => {
                if !transition.matches(&task) {
                    return Ok(None);
                }
                transition.apply(&mut task);
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        match self.tasks.get_mut(&id) {
            Some(mut task) if task.state == TaskState::Running => {
                task.last_heartbeat_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        Ok(sorted_tasks(
            self.tasks
                .iter()
                .filter(|t| t.state == state)
                .map(|t| t.clone())
                .collect(),
        ))
    }

    async fn list_user_tasks(&self, user_id: &str, state: Option<TaskState>) -> Result<Vec<Task>> {
        Ok(sorted_tasks(
            self.tasks
                .iter()
                .filter(|t| t.user_id == user_id && state.map_or(true, |s| t.state == s))
                .map(|t| t.clone())
                .collect(),
        ))
    }

    async fn find_task_by_approval(&self, approval_id: Uuid) -> Result<Option<Task>> {
        let task_id = match self.approval_tasks.get(&approval_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.tasks.get(&task_id).map(|t| t.clone()))
    }

    async fn purge_terminal_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut purged = 0u64;
        let mut released = Vec::new();
        self.tasks.retain(|_, t| {
            let expired = t.state.is_terminal() && t.updated_at < before;
            if expired {
                purged += 1;
                released.extend(t.approval_id);
            }
            !expired
        });
        for approval_id in released {
            self.approval_tasks.remove(&approval_id);
        }
        Ok(purged)
    }

    async fn insert_approval(&self, item: &ApprovalItem) -> Result<()> {
        match self.approvals.entry(item.id) {
            Entry::Occupied(_) => Err(JobPilotError::Conflict(format!(
                "approval {} already exists",
                item.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(())
            }
        }
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>> {
        Ok(self.approvals.get(&id).map(|a| a.clone()))
    }

    async fn list_approvals(
        &self,
        user_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>> {
        let mut items: Vec<ApprovalItem> = self
            .approvals
            .iter()
            .filter(|a| a.user_id == user_id && status.map_or(true, |s| a.status == s))
            .map(|a| a.clone())
            .collect();
        items.sort_by_key(|a| a.created_at);
        Ok(items)
    }

    async fn count_approvals(&self, user_id: &str, status: ApprovalStatus) -> Result<u64> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| a.user_id == user_id && a.status == status)
            .count() as u64)
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ApprovalUpdate> {
        match self.approvals.get_mut(&id) {
            Some(mut item) => {
                if item.status != ApprovalStatus::Pending {
                    return Ok(ApprovalUpdate::Conflict(item.clone()));
                }
                item.status = status;
                item.decided_at = Some(at);
                item.decision_reason = reason;
                Ok(ApprovalUpdate::Applied(item.clone()))
            }
            None => Ok(ApprovalUpdate::Missing),
        }
    }

    async fn attach_approval_task(&self, approval_id: Uuid, task_id: Uuid) -> Result<()> {
        if let Some(mut item) = self.approvals.get_mut(&approval_id) {
            item.task_id = Some(task_id);
        }
        Ok(())
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalItem>> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| a.is_expired_at(now))
            .map(|a| a.clone())
            .collect())
    }

    async fn list_undispatched_approvals(&self) -> Result<Vec<ApprovalItem>> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Approved && a.task_id.is_none())
            .map(|a| a.clone())
            .collect())
    }

    async fn append_activity(&self, activity: NewActivity) -> Result<ActivityEvent> {
        let mut log = self.activity.entry(activity.user_id.clone()).or_default();
        // Sequence is taken under the user's entry lock so per-user order matches seq order
        let seq = self.activity_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ActivityEvent {
            event_id: Uuid::new_v4(),
            seq,
            user_id: activity.user_id,
            task_id: activity.task_id,
            event_type: activity.kind.as_str().to_string(),
            data: activity.data,
            timestamp: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn activity_since(&self, user_id: &str, since: i64) -> Result<Vec<ActivityEvent>> {
        Ok(self
            .activity
            .get(user_id)
            .map(|log| log.iter().filter(|e| e.seq > since).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        self.dead_letters.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, agent_kind: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        let mut records: Vec<DeadLetterRecord> = self
            .dead_letters
            .iter()
            .filter(|r| agent_kind.map_or(true, |k| r.agent_kind == k))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn put_brake(&self, state: &BrakeState) -> Result<()> {
        self.brakes.insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn list_brakes(&self) -> Result<Vec<BrakeState>> {
        Ok(self.brakes.iter().map(|b| b.clone()).collect())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn daily_actions(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
        Ok(self
            .daily_counts
            .get(&(user_id.to_string(), day))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn try_consume_daily_action(
        &self,
        user_id: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<bool> {
        let mut count = self
            .daily_counts
            .entry((user_id.to_string(), day))
            .or_insert(0);
        if *count >= cap {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActivityKind, TaskLimits};
    use serde_json::json;

    fn task() -> Task {
        Task::new("u1", "scout", "search", json!({}), TaskLimits::default())
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let t = task();
        store.insert_task(&t).await.unwrap();

        let claim = TaskTransition::new(TaskState::Accepted, TaskState::Running);
        assert!(store.transition_task(t.id, &claim).await.unwrap().is_some());
        // Second claim sees `running` and loses
        assert!(store.transition_task(t.id, &claim).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disallowed_transition_errors() {
        let store = MemoryStore::new();
        let t = task();
        store.insert_task(&t).await.unwrap();

        let bad = TaskTransition::new(TaskState::Accepted, TaskState::Succeeded);
        assert!(matches!(
            store.transition_task(t.id, &bad).await,
            Err(JobPilotError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_one_task_per_approval() {
        let store = MemoryStore::new();
        let approval_id = Uuid::new_v4();
        store
            .insert_task(&task().with_approval(approval_id))
            .await
            .unwrap();
        let second = store.insert_task(&task().with_approval(approval_id)).await;
        assert!(matches!(second, Err(JobPilotError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_activity_is_ordered_per_user() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .append_activity(NewActivity::new("u1", ActivityKind::TaskStep, json!({"i": i})))
                .await
                .unwrap();
            store
                .append_activity(NewActivity::new("u2", ActivityKind::TaskStep, json!({"i": i})))
                .await
                .unwrap();
        }

        let events = store.activity_since("u1", 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

        let tail = store.activity_since("u1", events[0].seq).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_daily_counter_respects_cap() {
        let store = MemoryStore::new();
        let day = Utc::now().date_naive();
        assert!(store.try_consume_daily_action("u1", day, 2).await.unwrap());
        assert!(store.try_consume_daily_action("u1", day, 2).await.unwrap());
        assert!(!store.try_consume_daily_action("u1", day, 2).await.unwrap());
        assert_eq!(store.daily_actions("u1", day).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_only_old_terminal_tasks() {
        let store = MemoryStore::new();
        let mut done = task();
        done.state = TaskState::Succeeded;
        done.updated_at = Utc::now() - chrono::Duration::days(40);
        let live = task();
        store.insert_task(&done).await.unwrap();
        store.insert_task(&live).await.unwrap();

        let purged = store
            .purge_terminal_tasks(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_task(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_drops_approval_link() {
        let store = MemoryStore::new();
        let approval_id = Uuid::new_v4();
        let mut done = task().with_approval(approval_id);
        done.state = TaskState::Succeeded;
        done.updated_at = Utc::now() - chrono::Duration::days(40);
        store.insert_task(&done).await.unwrap();

        store
            .purge_terminal_tasks(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert!(store.find_task_by_approval(approval_id).await.unwrap().is_none());
        assert!(store.approval_tasks.is_empty());
    }
}
