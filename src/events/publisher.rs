//! Activity Publisher
//!
//! Appends every state change to the store and fans it out on a broadcast
//! channel. Appends for one user are serialized, so the store's sequence and
//! the broadcast order agree per user.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::pattern::ChannelPattern;
use crate::domain::{ActivityEvent, NewActivity};
use crate::error::Result;
use crate::persistence::Store;

const BROADCAST_CAPACITY: usize = 1024;
const DEDUPE_WINDOW: usize = 4096;

/// Subscription failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The receiver fell behind and `n` events were dropped; resync from the store
    #[error("subscriber lagged by {0} events")]
    Lagged(u64),
    #[error("publisher closed")]
    Closed,
}

#[derive(Clone)]
pub struct ActivityPublisher {
    store: Arc<dyn Store>,
    tx: broadcast::Sender<ActivityEvent>,
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ActivityPublisher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            store,
            tx,
            user_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist and broadcast one event
    pub async fn publish(&self, activity: NewActivity) -> Result<ActivityEvent> {
        let lock = self.user_lock(&activity.user_id);
        let _guard = lock.lock().await;

        let event = self.store.append_activity(activity).await?;
        debug!(
            "Published {} (seq {}) on {}",
            event.event_type,
            event.seq,
            event.channel()
        );
        // No receivers is fine; the store is the source of truth
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// Publish, logging instead of failing. For notifications that must not
    /// abort the state change that caused them.
    pub async fn emit(&self, activity: NewActivity) {
        let kind = activity.kind;
        let user_id = activity.user_id.clone();
        if let Err(e) = self.publish(activity).await {
            warn!("Failed to publish {} for {}: {}", kind, user_id, e);
        }
    }

    /// Live events whose channel matches `pattern`
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: ChannelPattern::parse(pattern),
            rx: self.tx.subscribe(),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }
}

/// Filtered, de-duplicating view of the broadcast channel
pub struct Subscription {
    pattern: ChannelPattern,
    rx: broadcast::Receiver<ActivityEvent>,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl Subscription {
    pub fn pattern(&self) -> &ChannelPattern {
        &self.pattern
    }

    /// Record `event_id`; false if it was already delivered
    fn first_delivery(&mut self, event_id: Uuid) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        if self.order.len() > DEDUPE_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Next matching event not seen before
    pub async fn recv(&mut self) -> std::result::Result<ActivityEvent, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.pattern.matches(&event.channel()) && self.first_delivery(event.event_id)
                    {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(SubscriptionError::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Mark an event delivered through another path (e.g. store replay)
    pub fn mark_seen(&mut self, event_id: Uuid) {
        self.first_delivery(event_id);
    }
}
