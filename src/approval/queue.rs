//! Approval Queue
//!
//! Deferred write actions waiting for a human. Every mutation is a
//! pending-guarded update; losing the race reports the status the item
//! actually has so the client can reconcile its optimistic view.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{ActivityKind, ApprovalItem, ApprovalStatus, NewActivity};
use crate::error::JobPilotError;
use crate::events::ActivityPublisher;
use crate::persistence::{ApprovalUpdate, Store};

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(Uuid),
    /// The item already left `pending`
    #[error("approval {id} is already {current}")]
    Conflict { id: Uuid, current: ApprovalStatus },
    /// The item passed `expires_at` and was expired by this call
    #[error("approval {0} has expired")]
    Expired(Uuid),
    #[error(transparent)]
    Store(#[from] JobPilotError),
}

impl ApprovalError {
    /// Status the item is known to be in, for conflict responses
    pub fn current_status(&self) -> Option<ApprovalStatus> {
        match self {
            ApprovalError::Conflict { current, .. } => Some(*current),
            ApprovalError::Expired(_) => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }
}

/// A deferred action to queue
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub user_id: String,
    pub agent_kind: String,
    pub action_name: String,
    pub payload: Value,
    pub rationale: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct BatchFailure {
    pub id: Uuid,
    pub error: String,
    pub current_status: Option<ApprovalStatus>,
}

/// Per-item results of a batch approve
#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub approved: Vec<ApprovalItem>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Clone)]
pub struct ApprovalQueue {
    store: Arc<dyn Store>,
    publisher: ActivityPublisher,
    ttl: chrono::Duration,
}

impl ApprovalQueue {
    pub fn new(store: Arc<dyn Store>, publisher: ActivityPublisher, ttl: chrono::Duration) -> Self {
        Self {
            store,
            publisher,
            ttl,
        }
    }

    pub async fn create(&self, new: NewApproval) -> Result<ApprovalItem, ApprovalError> {
        let now = Utc::now();
        let item = ApprovalItem {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            agent_kind: new.agent_kind,
            action_name: new.action_name,
            payload: new.payload,
            status: ApprovalStatus::Pending,
            rationale: new.rationale,
            confidence: new.confidence,
            created_at: now,
            decided_at: None,
            expires_at: now + self.ttl,
            decision_reason: None,
            task_id: None,
        };
        self.store.insert_approval(&item).await?;

        info!(
            "Queued {}/{} for approval by {} ({})",
            item.agent_kind, item.action_name, item.user_id, item.id
        );
        self.publisher
            .emit(NewActivity::new(
                &item.user_id,
                ActivityKind::ApprovalCreated,
                json!({
                    "approval_id": item.id,
                    "agent_kind": item.agent_kind,
                    "action": item.action_name,
                    "rationale": item.rationale,
                    "expires_at": item.expires_at,
                }),
            ))
            .await;

        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ApprovalItem>, ApprovalError> {
        Ok(self.store.get_approval(id).await?)
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>, ApprovalError> {
        Ok(self.store.list_approvals(user_id, status).await?)
    }

    /// Pending items for a user
    pub async fn count(&self, user_id: &str) -> Result<u64, ApprovalError> {
        Ok(self
            .store
            .count_approvals(user_id, ApprovalStatus::Pending)
            .await?)
    }

    async fn publish_decision(&self, item: &ApprovalItem) {
        let kind = match item.status {
            ApprovalStatus::Approved => ActivityKind::ApprovalApproved,
            ApprovalStatus::Rejected => ActivityKind::ApprovalRejected,
            ApprovalStatus::Expired => ActivityKind::ApprovalExpired,
            ApprovalStatus::Pending => return,
        };
        self.publisher
            .emit(NewActivity::new(
                &item.user_id,
                kind,
                json!({ "approval_id": item.id, "reason": item.decision_reason }),
            ))
            .await;
    }

    async fn transition(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let current = self
            .store
            .get_approval(id)
            .await?
            .ok_or(ApprovalError::NotFound(id))?;

        if current.is_expired_at(now) {
            if let ApprovalUpdate::Applied(expired) = self
                .store
                .resolve_approval(id, ApprovalStatus::Expired, Some("expired".into()), now)
                .await?
            {
                self.publish_decision(&expired).await;
                return Err(ApprovalError::Expired(id));
            }
        }

        match self.store.resolve_approval(id, status, reason, now).await? {
            ApprovalUpdate::Applied(item) => {
                debug!("Approval {} is now {}", id, item.status);
                self.publish_decision(&item).await;
                Ok(item)
            }
            ApprovalUpdate::Conflict(item) => Err(ApprovalError::Conflict {
                id,
                current: item.status,
            }),
            ApprovalUpdate::Missing => Err(ApprovalError::NotFound(id)),
        }
    }

    /// Pending → approved. Only the caller that gets `Ok` may dispatch.
    pub async fn approve(&self, id: Uuid) -> Result<ApprovalItem, ApprovalError> {
        self.transition(id, ApprovalStatus::Approved, None, Utc::now())
            .await
    }

    pub async fn reject(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<ApprovalItem, ApprovalError> {
        self.transition(id, ApprovalStatus::Rejected, reason, Utc::now())
            .await
    }

    /// Approve each id independently, collecting per-item failures
    pub async fn batch_approve(&self, ids: &[Uuid]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match self.approve(*id).await {
                Ok(item) => outcome.approved.push(item),
                Err(e) => outcome.failed.push(BatchFailure {
                    id: *id,
                    current_status: e.current_status(),
                    error: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Expire every pending item past its deadline at `now`
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalItem>, ApprovalError> {
        let mut expired = Vec::new();
        for item in self.store.list_expired_approvals(now).await? {
            if let ApprovalUpdate::Applied(item) = self
                .store
                .resolve_approval(item.id, ApprovalStatus::Expired, Some("expired".into()), now)
                .await?
            {
                self.publish_decision(&item).await;
                expired.push(item);
            }
        }
        if !expired.is_empty() {
            info!("Expired {} approval item(s)", expired.len());
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn queue() -> ApprovalQueue {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ApprovalQueue::new(
            store.clone(),
            ActivityPublisher::new(store),
            chrono::Duration::hours(48),
        )
    }

    fn new_item() -> NewApproval {
        NewApproval {
            user_id: "u1".to_string(),
            agent_kind: "applier".to_string(),
            action_name: "apply".to_string(),
            payload: json!({"job_id": "j1"}),
            rationale: "Tier L2 requires approval for writes".to_string(),
            confidence: None,
        }
    }

    #[tokio::test]
    async fn test_approve_then_reject_conflicts() {
        let q = queue();
        let item = q.create(new_item()).await.unwrap();
        assert_eq!(q.count("u1").await.unwrap(), 1);

        q.approve(item.id).await.unwrap();
        let err = q.reject(item.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::Conflict {
                current: ApprovalStatus::Approved,
                ..
            }
        ));
        assert_eq!(q.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_have_one_winner() {
        let q = queue();
        let item = q.create(new_item()).await.unwrap();

        let (a, b) = tokio::join!(q.approve(item.id), q.approve(item.id));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_batch_collects_failures() {
        let q = queue();
        let first = q.create(new_item()).await.unwrap();
        let second = q.create(new_item()).await.unwrap();
        q.reject(second.id, Some("not interested".into()))
            .await
            .unwrap();
        let missing = Uuid::new_v4();

        let outcome = q.batch_approve(&[first.id, second.id, missing]).await;
        assert_eq!(outcome.approved.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(
            outcome.failed[0].current_status,
            Some(ApprovalStatus::Rejected)
        );
        assert_eq!(outcome.failed[1].current_status, None);
    }

    #[tokio::test]
    async fn test_expired_item_cannot_be_approved() {
        let q = queue();
        let item = q.create(new_item()).await.unwrap();

        let later = item.expires_at + chrono::Duration::seconds(1);
        let expired = q.expire_due(later).await.unwrap();
        assert_eq!(expired.len(), 1);

        let err = q.approve(item.id).await.unwrap_err();
        assert_eq!(err.current_status(), Some(ApprovalStatus::Expired));
    }
}
