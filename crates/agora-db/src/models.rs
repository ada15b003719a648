//! Input and outcome types for the store. Read models come straight from
//! `agora_types::models`; these cover inserts and multi-branch writes.

use agora_types::models::{AuditAction, ConversationKind, Message, MessageType, SanctionType};
use agora_types::{ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};

pub struct NewConversation<'a> {
    pub kind: ConversationKind,
    pub name: Option<&'a str>,
    pub owner_id: UserId,
    pub is_public: bool,
    pub max_members: u32,
}

pub struct NewMessage<'a> {
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub content: &'a str,
    pub message_type: MessageType,
    pub parent_message_id: Option<MessageId>,
    /// Already resolved to active members; rows are inserted in the same transaction.
    pub mentions: &'a [UserId],
}

pub struct NewSanction<'a> {
    pub user_id: UserId,
    pub moderator_id: UserId,
    pub sanction_type: SanctionType,
    pub reason: &'a str,
    pub conversation_id: Option<ConversationId>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct NewAuditEntry<'a> {
    pub action: AuditAction,
    pub actor_id: UserId,
    pub conversation_id: Option<ConversationId>,
    pub target_user_id: Option<UserId>,
    pub message_id: Option<MessageId>,
    pub details: &'a serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMemberOutcome {
    Added,
    /// A soft-left row was reactivated.
    Rejoined,
    AlreadyMember,
    Full,
}

impl AddMemberOutcome {
    pub fn is_new_membership(&self) -> bool {
        matches!(self, Self::Added | Self::Rejoined)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Edited {
        message: Message,
        /// Mention rows this edit introduced.
        new_mentions: Vec<UserId>,
    },
    NotFound,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TombstoneOutcome {
    Deleted(Message),
    AlreadyDeleted(Message),
    NotFound,
}
