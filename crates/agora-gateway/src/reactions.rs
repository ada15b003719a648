use chrono::Utc;
use tracing::debug;

use agora_types::events::ServerEvent;
use agora_types::models::{Mention, Principal};
use agora_types::MessageId;

use crate::error::{HubError, HubResult};
use crate::hub::Hub;

const MAX_REACTION_CHARS: usize = 64;
const MAX_MENTION_PAGE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactOutcome {
    Added,
    /// The same user already had this reaction; nothing was broadcast.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreactOutcome {
    Removed,
    NotPresent,
}

fn validate_reaction(reaction_type: &str) -> HubResult<()> {
    if reaction_type.trim().is_empty() {
        return Err(HubError::validation("reaction type is empty"));
    }
    if reaction_type.chars().count() > MAX_REACTION_CHARS {
        return Err(HubError::validation(format!(
            "reaction type exceeds {} characters",
            MAX_REACTION_CHARS
        )));
    }
    Ok(())
}

impl Hub {
    // -- Reactions --

    pub async fn react(&self, actor: &Principal, message_id: MessageId, reaction_type: String) -> HubResult<ReactOutcome> {
        validate_reaction(&reaction_type)?;
        let message = self.message(message_id).await?;
        if message.is_deleted() {
            return Err(HubError::NotFound("message"));
        }
        let conversation_id = message.conversation_id;
        self.ensure_member(conversation_id, actor.user_id).await?;
        self.ensure_not_banned_from(actor.user_id, conversation_id).await?;

        let user_id = actor.user_id;
        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let row_type = reaction_type.clone();
            let added = hub
                .store("add_reaction", move |db| db.add_reaction(message_id, user_id, &row_type, now))
                .await?;
            if !added {
                return Ok(ReactOutcome::AlreadyPresent);
            }

            hub.inner
                .registry
                .broadcast(
                    conversation_id,
                    ServerEvent::ReactionAdded {
                        message_id,
                        conversation_id,
                        user_id,
                        reaction_type,
                        timestamp: now,
                    },
                )
                .await;
            Ok(ReactOutcome::Added)
        })
        .await
    }

    /// Works on tombstoned messages too, so stale reactions can be cleared.
    pub async fn unreact(
        &self,
        actor: &Principal,
        message_id: MessageId,
        reaction_type: String,
    ) -> HubResult<UnreactOutcome> {
        validate_reaction(&reaction_type)?;
        let message = self.message(message_id).await?;
        let conversation_id = message.conversation_id;
        self.ensure_member(conversation_id, actor.user_id).await?;

        let user_id = actor.user_id;
        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let row_type = reaction_type.clone();
            let removed = hub
                .store("remove_reaction", move |db| db.remove_reaction(message_id, user_id, &row_type))
                .await?;
            if !removed {
                return Ok(UnreactOutcome::NotPresent);
            }

            hub.inner
                .registry
                .broadcast(
                    conversation_id,
                    ServerEvent::ReactionRemoved {
                        message_id,
                        conversation_id,
                        user_id,
                        reaction_type,
                        timestamp: Utc::now(),
                    },
                )
                .await;
            Ok(UnreactOutcome::Removed)
        })
        .await
    }

    // -- Mentions --

    pub async fn mark_mention_read(&self, actor: &Principal, message_id: MessageId) -> HubResult<()> {
        let user_id = actor.user_id;
        let updated = self
            .store("mark_mention_read", move |db| db.mark_mention_read(message_id, user_id))
            .await?;
        if !updated {
            return Err(HubError::NotFound("mention"));
        }
        debug!(message_id, user_id, "mention read");
        Ok(())
    }

    /// The caller's mentions, newest first.
    pub async fn mentions(&self, actor: &Principal, unread_only: bool, limit: Option<u32>) -> HubResult<Vec<Mention>> {
        let user_id = actor.user_id;
        let limit = limit.unwrap_or(50).clamp(1, MAX_MENTION_PAGE);
        self.store("mentions_for_user", move |db| db.mentions_for_user(user_id, unread_only, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_types_are_bounded() {
        assert!(validate_reaction("👍").is_ok());
        assert!(validate_reaction("thumbs_up").is_ok());
        assert!(matches!(validate_reaction("  "), Err(HubError::Validation(_))));
        assert!(matches!(validate_reaction(&"x".repeat(65)), Err(HubError::Validation(_))));
        assert!(validate_reaction(&"x".repeat(64)).is_ok());
    }
}
