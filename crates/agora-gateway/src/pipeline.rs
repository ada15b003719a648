//! Message pipeline: validate, rate-limit, authorize, persist, fan out.
//!
//! Every write takes the conversation's sequencing lock before it commits and
//! keeps it until all subscriber queues have the resulting event, so every
//! session observes a conversation's events in commit order. The commit runs
//! on a detached task; a sender disconnecting mid-send cannot leave a
//! committed message unbroadcast.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use agora_db::models::{EditOutcome, NewMessage, TombstoneOutcome};
use agora_types::api::{MessageResponse, ReactionGroup};
use agora_types::events::ServerEvent;
use agora_types::models::{
    AuditAction, Conversation, Message, MessageHistoryEntry, MessageType, Principal, Reaction,
};
use agora_types::{ConversationId, MessageId, UserId};

use crate::audit::AuditRecord;
use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::mentions::{excerpt, parse_mentions};
use crate::moderation::ModeratedAction;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;
const MENTION_EXCERPT_CHARS: usize = 120;

impl Hub {
    /// Blank or overlong content and malformed mentions are rejected here,
    /// before anything touches the rate limiter or the store.
    fn validate_content(&self, content: &str) -> HubResult<Vec<String>> {
        if content.trim().is_empty() {
            return Err(HubError::validation("message content is empty"));
        }
        let max = self.inner.config.max_message_chars;
        if content.chars().count() > max {
            return Err(HubError::validation(format!("message exceeds {} characters", max)));
        }
        parse_mentions(content)
    }

    /// Mentioned usernames that are active members, minus the author.
    async fn resolve_mentions(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        names: Vec<String>,
    ) -> HubResult<Vec<UserId>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let resolved = self
            .store("resolve_member_usernames", move |db| {
                db.resolve_member_usernames(conversation_id, &names)
            })
            .await?;
        Ok(resolved
            .into_iter()
            .map(|(id, _)| id)
            .filter(|&id| id != author_id)
            .collect())
    }

    /// Posting rules shared by send and edit: open conversation, active
    /// membership, no conversation mute, no sanction.
    async fn ensure_can_post(&self, actor: &Principal, conversation: &Conversation) -> HubResult<()> {
        if conversation.is_archived {
            return Err(HubError::forbidden("conversation is archived"));
        }
        let member = self.active_member(conversation.id, actor.user_id).await?;
        if member.is_muted {
            return Err(HubError::SanctionDenied("muted in this conversation".into()));
        }
        self.check_sanctions(actor.user_id, ModeratedAction::Post, Some(conversation.id))
            .await?
            .into_result()
    }

    /// Authors may change their own messages; conversation owners and
    /// moderators, and global moderators, may change anyone's.
    async fn ensure_can_modify(&self, actor: &Principal, message: &Message) -> HubResult<()> {
        if message.author_id == actor.user_id || actor.role.is_moderator() {
            return Ok(());
        }
        match self.membership(message.conversation_id, actor.user_id).await? {
            Some(member) if member.role.can_moderate() => Ok(()),
            _ => Err(HubError::forbidden("not allowed to modify this message")),
        }
    }

    // -- Send --

    /// The rate-limit slot is taken before the conversation checks and given
    /// back if any of them refuses the message.
    pub async fn send_message(
        &self,
        actor: &Principal,
        conversation_id: ConversationId,
        content: String,
        parent_message_id: Option<MessageId>,
    ) -> HubResult<Message> {
        let names = self.validate_content(&content)?;
        let stamp = self.inner.limiter.check(actor.user_id).await?;

        let mentions = match self
            .authorize_send(actor, conversation_id, parent_message_id, names)
            .await
        {
            Ok(mentions) => mentions,
            Err(e) => {
                self.inner.limiter.refund(actor.user_id, stamp).await;
                return Err(e);
            }
        };
        let author_id = actor.user_id;

        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let mention_ids = mentions.clone();
            let message = hub
                .store("insert_message", move |db| {
                    db.insert_message(
                        &NewMessage {
                            conversation_id,
                            author_id,
                            content: &content,
                            message_type: MessageType::Text,
                            parent_message_id,
                            mentions: &mention_ids,
                        },
                        now,
                    )
                })
                .await?;

            let delivered = hub
                .inner
                .registry
                .broadcast(conversation_id, ServerEvent::Message { message: message.clone() })
                .await;
            hub.notify_mentions(&message, &mentions).await;

            debug!(
                message_id = message.id,
                conversation_id,
                author_id,
                delivered,
                mentions = mentions.len(),
                "message committed"
            );
            Ok(message)
        })
        .await
    }

    /// Conversation, posting rights and parent checks for a send. Returns
    /// the resolved mentions.
    async fn authorize_send(
        &self,
        actor: &Principal,
        conversation_id: ConversationId,
        parent_message_id: Option<MessageId>,
        names: Vec<String>,
    ) -> HubResult<Vec<UserId>> {
        let conversation = self.conversation(conversation_id).await?;
        self.ensure_can_post(actor, &conversation).await?;

        if let Some(parent_id) = parent_message_id {
            let parent = self.message(parent_id).await?;
            if parent.conversation_id != conversation_id || parent.is_deleted() {
                return Err(HubError::NotFound("parent message"));
            }
        }

        self.resolve_mentions(conversation_id, actor.user_id, names).await
    }

    /// Mention notices go to every live session of each mentioned user,
    /// whether or not it is subscribed to the conversation.
    async fn notify_mentions(&self, message: &Message, mentioned: &[UserId]) {
        for &user_id in mentioned {
            self.notify_user(
                user_id,
                ServerEvent::Mention {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    author_id: message.author_id,
                    author_username: message.author_username.clone(),
                    excerpt: excerpt(&message.content, MENTION_EXCERPT_CHARS),
                    timestamp: message.updated_at,
                },
            )
            .await;
        }
    }

    // -- Edit / delete / pin --

    pub async fn edit_message(&self, actor: &Principal, message_id: MessageId, content: String) -> HubResult<Message> {
        let names = self.validate_content(&content)?;
        let message = self.message(message_id).await?;
        if message.is_deleted() {
            return Err(HubError::validation("message has been deleted"));
        }
        self.ensure_can_modify(actor, &message).await?;

        let conversation = self.conversation(message.conversation_id).await?;
        if conversation.is_archived {
            return Err(HubError::forbidden("conversation is archived"));
        }
        if message.author_id == actor.user_id {
            self.ensure_can_post(actor, &conversation).await?;
        }

        let conversation_id = conversation.id;
        let mentions = self.resolve_mentions(conversation_id, message.author_id, names).await?;
        let edited_by = actor.user_id;

        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let outcome = hub
                .store("edit_message", move |db| {
                    db.edit_message(message_id, &content, edited_by, &mentions, now)
                })
                .await?;

            let (message, new_mentions) = match outcome {
                EditOutcome::Edited { message, new_mentions } => (message, new_mentions),
                EditOutcome::NotFound => return Err(HubError::NotFound("message")),
                EditOutcome::Deleted => return Err(HubError::validation("message has been deleted")),
            };

            hub.inner
                .registry
                .broadcast(conversation_id, ServerEvent::MessageEdited { message: message.clone() })
                .await;
            hub.notify_mentions(&message, &new_mentions).await;
            debug!(message_id, conversation_id, edited_by, "message edited");
            hub.audit(
                AuditRecord::new(AuditAction::MessageEdited, edited_by)
                    .conversation(conversation_id)
                    .target(message.author_id)
                    .message(message_id),
            )
            .await;
            Ok(message)
        })
        .await
    }

    /// Tombstone a message. Deleting one that is already gone succeeds
    /// without a second broadcast.
    pub async fn delete_message(&self, actor: &Principal, message_id: MessageId) -> HubResult<()> {
        let message = self.message(message_id).await?;
        self.ensure_can_modify(actor, &message).await?;
        if message.is_deleted() {
            return Ok(());
        }

        let conversation_id = message.conversation_id;
        let deleted_by = actor.user_id;
        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let outcome = hub
                .store("tombstone_message", move |db| db.tombstone_message(message_id, now))
                .await?;

            match outcome {
                TombstoneOutcome::Deleted(message) => {
                    hub.inner
                        .registry
                        .broadcast(
                            conversation_id,
                            ServerEvent::MessageDeleted {
                                id: message_id,
                                conversation_id,
                                deleted_by,
                                timestamp: now,
                            },
                        )
                        .await;
                    info!(message_id, conversation_id, deleted_by, "message deleted");
                    hub.audit(
                        AuditRecord::new(AuditAction::MessageDeleted, deleted_by)
                            .conversation(conversation_id)
                            .target(message.author_id)
                            .message(message_id),
                    )
                    .await;
                    Ok(())
                }
                TombstoneOutcome::AlreadyDeleted(_) => Ok(()),
                TombstoneOutcome::NotFound => Err(HubError::NotFound("message")),
            }
        })
        .await
    }

    pub async fn set_pinned(&self, actor: &Principal, message_id: MessageId, pinned: bool) -> HubResult<Message> {
        let message = self.message(message_id).await?;
        if message.is_deleted() {
            return Err(HubError::NotFound("message"));
        }
        let conversation_id = message.conversation_id;
        if !actor.role.is_moderator() {
            let member = self.active_member(conversation_id, actor.user_id).await?;
            if !member.role.can_moderate() {
                return Err(HubError::forbidden("only owners and moderators can pin"));
            }
        }

        let pinned_by = actor.user_id;
        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let message = hub
                .store("set_pinned", move |db| db.set_pinned(message_id, pinned, now))
                .await?
                .ok_or(HubError::NotFound("message"))?;

            hub.inner
                .registry
                .broadcast(
                    conversation_id,
                    ServerEvent::MessagePinned {
                        id: message_id,
                        conversation_id,
                        pinned,
                        pinned_by,
                        timestamp: now,
                    },
                )
                .await;
            let action = if pinned { AuditAction::MessagePinned } else { AuditAction::MessageUnpinned };
            hub.audit(
                AuditRecord::new(action, pinned_by)
                    .conversation(conversation_id)
                    .message(message_id),
            )
            .await;
            Ok(message)
        })
        .await
    }

    // -- Reads --

    /// A page of messages, newest first, strictly older than `before` when
    /// given, with reactions grouped per message.
    pub async fn history(
        &self,
        actor: &Principal,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> HubResult<Vec<MessageResponse>> {
        let conversation = self.conversation(conversation_id).await?;
        self.ensure_can_read(actor, &conversation).await?;

        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let (messages, reactions) = self
            .store("get_messages", move |db| {
                let messages = db.get_messages(conversation_id, before, limit)?;
                let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
                let reactions = db.get_reactions_for_messages(&ids)?;
                Ok((messages, reactions))
            })
            .await?;

        Ok(with_reactions(messages, reactions))
    }

    /// Pinned messages of a conversation, newest first.
    pub async fn pinned(&self, actor: &Principal, conversation_id: ConversationId) -> HubResult<Vec<MessageResponse>> {
        let conversation = self.conversation(conversation_id).await?;
        self.ensure_can_read(actor, &conversation).await?;

        let (messages, reactions) = self
            .store("pinned_messages", move |db| {
                let messages = db.pinned_messages(conversation_id)?;
                let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
                let reactions = db.get_reactions_for_messages(&ids)?;
                Ok((messages, reactions))
            })
            .await?;
        Ok(with_reactions(messages, reactions))
    }

    /// Prior versions of a message, oldest first.
    pub async fn message_history(&self, actor: &Principal, message_id: MessageId) -> HubResult<Vec<MessageHistoryEntry>> {
        let message = self.message(message_id).await?;
        let conversation = self.conversation(message.conversation_id).await?;
        self.ensure_can_read(actor, &conversation).await?;
        self.store("message_history", move |db| db.message_history(message_id))
            .await
    }
}

/// Attach reactions to their messages, grouped by type in order of first
/// reaction.
fn with_reactions(messages: Vec<Message>, reactions: Vec<Reaction>) -> Vec<MessageResponse> {
    let mut grouped: HashMap<MessageId, Vec<ReactionGroup>> = HashMap::new();
    for r in reactions {
        let groups = grouped.entry(r.message_id).or_default();
        match groups.iter_mut().find(|g| g.reaction_type == r.reaction_type) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(r.user_id);
            }
            None => groups.push(ReactionGroup {
                reaction_type: r.reaction_type,
                count: 1,
                user_ids: vec![r.user_id],
            }),
        }
    }

    messages
        .into_iter()
        .map(|message| MessageResponse {
            reactions: grouped.remove(&message.id).unwrap_or_default(),
            message,
        })
        .collect()
}
