use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Conversation, ConversationKind, MemberRole, Message, UserStatus};
use crate::{ConversationId, MessageId, SessionId, UserId};

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Token missing, invalid, expired, or logged out.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Connection refused by an active ban.
    pub const FORBIDDEN: u16 = 4403;
    /// Outbound queue overflowed; the client was too slow.
    pub const BACKPRESSURE: u16 = 4408;
    /// No inbound activity within the idle timeout.
    pub const IDLE_TIMEOUT: u16 = 4000;
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Join {
        conversation_id: ConversationId,
    },

    Leave {
        conversation_id: ConversationId,
    },

    Send {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        parent_message_id: Option<MessageId>,
    },

    Edit {
        message_id: MessageId,
        content: String,
    },

    Delete {
        message_id: MessageId,
    },

    React {
        message_id: MessageId,
        reaction_type: String,
    },

    Unreact {
        message_id: MessageId,
        reaction_type: String,
    },

    MarkRead {
        conversation_id: ConversationId,
        up_to_message_id: MessageId,
    },

    MarkMentionRead {
        message_id: MessageId,
    },

    /// Get or create the direct-message conversation with another user
    OpenDirect {
        user_id: UserId,
    },

    CreateConversation {
        kind: ConversationKind,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        is_public: bool,
        #[serde(default)]
        max_members: Option<u32>,
    },

    Invite {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    Pin {
        message_id: MessageId,
        pinned: bool,
    },

    Archive {
        conversation_id: ConversationId,
    },

    /// Replace the connection's credentials before the current token expires
    RefreshToken {
        token: String,
    },

    /// End the session token: every connection using it is closed
    Logout,

    Ping,
}

impl ClientCommand {
    /// Wire name of the command, echoed back in error events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Send { .. } => "send",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::React { .. } => "react",
            Self::Unreact { .. } => "unreact",
            Self::MarkRead { .. } => "mark_read",
            Self::MarkMentionRead { .. } => "mark_mention_read",
            Self::OpenDirect { .. } => "open_direct",
            Self::CreateConversation { .. } => "create_conversation",
            Self::Invite { .. } => "invite",
            Self::Pin { .. } => "pin",
            Self::Archive { .. } => "archive",
            Self::RefreshToken { .. } => "refresh_token",
            Self::Logout => "logout",
            Self::Ping => "ping",
        }
    }
}

/// Machine-readable error category carried by `ServerEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Auth,
    Validation,
    RateLimited,
    SanctionDenied,
    NotFound,
    Forbidden,
    Backpressure,
    Internal,
    BadCommand,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::SanctionDenied => "sanction_denied",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Backpressure => "backpressure",
            Self::Internal => "internal",
            Self::BadCommand => "bad_command",
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready {
        session_id: SessionId,
        user_id: UserId,
        username: String,
        conversation_ids: Vec<ConversationId>,
    },

    /// A new message was committed
    Message { message: Message },

    MessageEdited { message: Message },

    MessageDeleted {
        id: MessageId,
        conversation_id: ConversationId,
        deleted_by: UserId,
        timestamp: DateTime<Utc>,
    },

    MessagePinned {
        id: MessageId,
        conversation_id: ConversationId,
        pinned: bool,
        pinned_by: UserId,
        timestamp: DateTime<Utc>,
    },

    ReactionAdded {
        message_id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        reaction_type: String,
        timestamp: DateTime<Utc>,
    },

    ReactionRemoved {
        message_id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        reaction_type: String,
        timestamp: DateTime<Utc>,
    },

    /// Delivered to every session of a mentioned user, subscribed or not
    Mention {
        message_id: MessageId,
        conversation_id: ConversationId,
        author_id: UserId,
        author_username: String,
        excerpt: String,
        timestamp: DateTime<Utc>,
    },

    PresenceChanged {
        user_id: UserId,
        status: UserStatus,
        last_seen: DateTime<Utc>,
    },

    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },

    MemberJoined {
        conversation_id: ConversationId,
        user_id: UserId,
        role: MemberRole,
        timestamp: DateTime<Utc>,
    },

    MemberLeft {
        conversation_id: ConversationId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// Sent to the joining user's own sessions
    ConversationJoined { conversation: Conversation },

    ConversationLeft {
        conversation_id: ConversationId,
        timestamp: DateTime<Utc>,
    },

    ConversationArchived {
        conversation_id: ConversationId,
        archived_by: UserId,
        timestamp: DateTime<Utc>,
    },

    Error {
        code: ErrorCode,
        message: String,
        command: Option<String>,
    },

    Pong { timestamp: DateTime<Utc> },
}

impl ServerEvent {
    /// Returns the conversation this event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::Message { message } | Self::MessageEdited { message } => {
                Some(message.conversation_id)
            }
            Self::MessageDeleted { conversation_id, .. }
            | Self::MessagePinned { conversation_id, .. }
            | Self::ReactionAdded { conversation_id, .. }
            | Self::ReactionRemoved { conversation_id, .. }
            | Self::Mention { conversation_id, .. }
            | Self::ReadReceipt { conversation_id, .. }
            | Self::MemberJoined { conversation_id, .. }
            | Self::MemberLeft { conversation_id, .. }
            | Self::ConversationLeft { conversation_id, .. }
            | Self::ConversationArchived { conversation_id, .. } => Some(*conversation_id),
            Self::ConversationJoined { conversation } => Some(conversation.id),
            // Ready, PresenceChanged, Error, Pong are not conversation-scoped
            Self::Ready { .. }
            | Self::PresenceChanged { .. }
            | Self::Error { .. }
            | Self::Pong { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_command_parses_without_parent() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"send","data":{"conversation_id":42,"content":"hello @bob"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Send {
                conversation_id: 42,
                content: "hello @bob".into(),
                parent_message_id: None,
            }
        );
        assert_eq!(cmd.name(), "send");
    }

    #[test]
    fn unit_commands_parse() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Ping);
        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"logout"}"#).unwrap();
        assert_eq!(cmd.name(), "logout");
    }

    #[test]
    fn error_event_uses_snake_case_tags() {
        let event = ServerEvent::Error {
            code: ErrorCode::RateLimited,
            message: "slow down".into(),
            command: Some("send".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "rate_limited");
        assert_eq!(json["data"]["code"], ErrorCode::RateLimited.as_str());
    }
}
