//! Replay-then-live activity stream for one user

use std::collections::VecDeque;
use tracing::warn;

use super::pattern::ChannelPattern;
use super::publisher::{ActivityPublisher, Subscription, SubscriptionError};
use crate::domain::ActivityEvent;
use crate::error::Result;

/// Events with `seq > since` from the store, then live events, gap-free.
///
/// The live subscription is opened before the replay query, so an event
/// appended in between shows up in one of the two and the `seq` watermark
/// drops the copy.
pub struct ActivityStream {
    publisher: ActivityPublisher,
    user_id: String,
    subscription: Subscription,
    buffer: VecDeque<ActivityEvent>,
    last_seq: i64,
}

impl ActivityStream {
    pub async fn open(publisher: ActivityPublisher, user_id: &str, since: i64) -> Result<Self> {
        let subscription = publisher.subscribe(&ChannelPattern::user(user_id).to_string());
        let mut stream = Self {
            publisher,
            user_id: user_id.to_string(),
            subscription,
            buffer: VecDeque::new(),
            last_seq: since,
        };
        stream.replay().await?;
        Ok(stream)
    }

    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    async fn replay(&mut self) -> Result<()> {
        let events = self
            .publisher
            .store()
            .activity_since(&self.user_id, self.last_seq)
            .await?;
        let mut watermark = self
            .buffer
            .back()
            .map(|e| e.seq)
            .unwrap_or(self.last_seq);
        for event in events {
            if event.seq > watermark {
                watermark = event.seq;
                self.subscription.mark_seen(event.event_id);
                self.buffer.push_back(event);
            }
        }
        Ok(())
    }

    /// Next event in append order; `None` once the publisher is gone
    pub async fn next(&mut self) -> Result<Option<ActivityEvent>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.last_seq = event.seq;
                return Ok(Some(event));
            }

            match self.subscription.recv().await {
                Ok(event) if event.seq > self.last_seq => {
                    self.last_seq = event.seq;
                    return Ok(Some(event));
                }
                Ok(_) => continue,
                Err(SubscriptionError::Lagged(n)) => {
                    warn!(
                        "Activity stream for {} lagged by {} events, resyncing from seq {}",
                        self.user_id, n, self.last_seq
                    );
                    self.replay().await?;
                }
                Err(SubscriptionError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActivityKind, NewActivity};
    use crate::persistence::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_replay_then_live() {
        let publisher = ActivityPublisher::new(Arc::new(MemoryStore::new()));
        let first = publisher
            .publish(NewActivity::new("u1", ActivityKind::TaskAccepted, json!({})))
            .await
            .unwrap();
        let second = publisher
            .publish(NewActivity::new("u1", ActivityKind::TaskRunning, json!({})))
            .await
            .unwrap();

        let mut stream = ActivityStream::open(publisher.clone(), "u1", first.seq)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().seq, second.seq);

        let live = publisher
            .publish(NewActivity::new("u1", ActivityKind::TaskSucceeded, json!({})))
            .await
            .unwrap();
        publisher
            .publish(NewActivity::new("u2", ActivityKind::TaskSucceeded, json!({})))
            .await
            .unwrap();
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.event_id, live.event_id);
        assert_eq!(stream.last_seq(), live.seq);
    }
}
