use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use agora_types::events::ServerEvent;
use agora_types::models::{Principal, UserStatus};
use agora_types::{ConversationId, MessageId, UserId};

use crate::error::{HubError, HubResult};
use crate::hub::Hub;

struct PresenceEntry {
    live: usize,
    /// Bumped on every connect and on the last disconnect; a pending offline
    /// transition only applies if nothing happened since it was scheduled.
    generation: u64,
    status: UserStatus,
    last_seen: DateTime<Utc>,
}

/// Online/offline state derived from live session counts.
#[derive(Default)]
pub struct PresenceTracker {
    users: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the user just came online.
    pub async fn session_opened(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        let mut users = self.users.lock().await;
        let entry = users.entry(user_id).or_insert(PresenceEntry {
            live: 0,
            generation: 0,
            status: UserStatus::Offline,
            last_seen: now,
        });
        entry.live += 1;
        entry.generation += 1;
        entry.last_seen = now;
        if entry.status == UserStatus::Online {
            return false;
        }
        entry.status = UserStatus::Online;
        true
    }

    /// Returns the generation to settle if this was the user's last session.
    pub async fn session_closed(&self, user_id: UserId, now: DateTime<Utc>) -> Option<u64> {
        let mut users = self.users.lock().await;
        let entry = users.get_mut(&user_id)?;
        entry.live = entry.live.saturating_sub(1);
        entry.last_seen = now;
        if entry.live > 0 {
            return None;
        }
        entry.generation += 1;
        Some(entry.generation)
    }

    /// Go offline if nothing changed since `generation` was handed out.
    /// Returns the `last_seen` to announce.
    pub async fn settle(&self, user_id: UserId, generation: u64) -> Option<DateTime<Utc>> {
        let mut users = self.users.lock().await;
        let entry = users.get_mut(&user_id)?;
        if entry.live > 0 || entry.generation != generation || entry.status == UserStatus::Offline {
            return None;
        }
        entry.status = UserStatus::Offline;
        Some(entry.last_seen)
    }

    pub async fn status(&self, user_id: UserId) -> (UserStatus, Option<DateTime<Utc>>) {
        match self.users.lock().await.get(&user_id) {
            Some(entry) => (entry.status, Some(entry.last_seen)),
            None => (UserStatus::Offline, None),
        }
    }
}

impl Hub {
    // -- Presence --

    pub(crate) async fn presence_session_opened(&self, user_id: UserId) {
        let now = Utc::now();
        if self.inner.presence.session_opened(user_id, now).await {
            self.broadcast_presence(user_id, UserStatus::Online, now).await;
        }
    }

    /// The offline transition waits out the grace period so a quick
    /// reconnect produces no presence churn.
    pub(crate) async fn presence_session_closed(&self, user_id: UserId) {
        let Some(generation) = self.inner.presence.session_closed(user_id, Utc::now()).await else {
            return;
        };
        let hub = self.clone();
        let grace = self.inner.config.presence_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(last_seen) = hub.inner.presence.settle(user_id, generation).await {
                hub.broadcast_presence(user_id, UserStatus::Offline, last_seen).await;
            }
        });
    }

    async fn broadcast_presence(&self, user_id: UserId, status: UserStatus, last_seen: DateTime<Utc>) {
        let conversations = self.inner.registry.user_conversations(user_id).await;
        let delivered = self
            .inner
            .registry
            .broadcast_many(
                &conversations,
                ServerEvent::PresenceChanged {
                    user_id,
                    status,
                    last_seen,
                },
            )
            .await;
        debug!(user_id, %status, delivered, "presence changed");
    }

    pub async fn presence_of(&self, user_id: UserId) -> (UserStatus, Option<DateTime<Utc>>) {
        self.inner.presence.status(user_id).await
    }

    // -- Read receipts --

    /// Advance the caller's read pointer. Returns false if `message_id` was
    /// not past the current pointer; the pointer never moves back.
    pub async fn mark_read(
        &self,
        actor: &Principal,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> HubResult<bool> {
        let message = self.message(message_id).await?;
        if message.conversation_id != conversation_id {
            return Err(HubError::validation("message does not belong to this conversation"));
        }
        self.ensure_member(conversation_id, actor.user_id).await?;
        self.ensure_not_banned_from(actor.user_id, conversation_id).await?;

        let hub = self.clone();
        let user_id = actor.user_id;
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let advanced = hub
                .store("advance_read_pointer", move |db| {
                    db.advance_read_pointer(conversation_id, user_id, message_id, now)
                })
                .await?;
            if advanced {
                hub.inner
                    .registry
                    .broadcast(
                        conversation_id,
                        ServerEvent::ReadReceipt {
                            conversation_id,
                            user_id,
                            message_id,
                            timestamp: now,
                        },
                    )
                    .await;
            }
            Ok(advanced)
        })
        .await
    }

    pub async fn last_read_of(&self, user_id: UserId, conversation_id: ConversationId) -> HubResult<Option<MessageId>> {
        self.store("last_read", move |db| db.last_read(conversation_id, user_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn online_on_first_session_offline_after_last() {
        let tracker = PresenceTracker::new();
        let now = Utc::now();

        assert!(tracker.session_opened(1, now).await);
        assert!(!tracker.session_opened(1, now).await);
        assert_eq!(tracker.session_closed(1, now).await, None);

        let generation = tracker.session_closed(1, now).await.unwrap();
        assert_eq!(tracker.status(1).await.0, UserStatus::Online);
        assert!(tracker.settle(1, generation).await.is_some());
        assert_eq!(tracker.status(1).await.0, UserStatus::Offline);
        assert!(tracker.settle(1, generation).await.is_none());
    }

    #[tokio::test]
    async fn reconnect_within_grace_cancels_offline() {
        let tracker = PresenceTracker::new();
        let now = Utc::now();

        tracker.session_opened(7, now).await;
        let generation = tracker.session_closed(7, now).await.unwrap();
        // Back before the grace period ran out: no new online transition.
        assert!(!tracker.session_opened(7, now).await);
        assert!(tracker.settle(7, generation).await.is_none());
        assert_eq!(tracker.status(7).await.0, UserStatus::Online);
    }

    #[tokio::test]
    async fn unknown_user_is_offline() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.status(99).await, (UserStatus::Offline, None));
        assert_eq!(tracker.session_closed(99, Utc::now()).await, None);
    }
}
