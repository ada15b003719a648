use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConversationId, MessageId, SanctionId, UserId};

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Enums that are stored as lowercase text columns and sent as snake_case on the wire.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// Global role assigned by the identity service.
    Role {
        User => "user",
        Moderator => "moderator",
        Admin => "admin",
        SuperAdmin => "super_admin",
    }
}

impl Role {
    fn rank(&self) -> u8 {
        match self {
            Self::User => 0,
            Self::Moderator => 1,
            Self::Admin => 2,
            Self::SuperAdmin => 3,
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.rank() >= Self::Moderator.rank()
    }

    pub fn is_admin(&self) -> bool {
        self.rank() >= Self::Admin.rank()
    }
}

text_enum! {
    UserStatus {
        Online => "online",
        Away => "away",
        Offline => "offline",
    }
}

text_enum! {
    ConversationKind {
        DirectMessage => "direct_message",
        PublicRoom => "public_room",
        PrivateRoom => "private_room",
        Group => "group",
    }
}

impl ConversationKind {
    /// Private rooms and groups can only be entered through an existing membership or an invite.
    pub fn requires_invite(&self) -> bool {
        matches!(self, Self::PrivateRoom | Self::Group)
    }
}

text_enum! {
    /// Role inside a single conversation.
    MemberRole {
        Member => "member",
        Owner => "owner",
        Moderator => "moderator",
    }
}

impl MemberRole {
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Owner | Self::Moderator)
    }
}

text_enum! {
    MessageStatus {
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Edited => "edited",
        Deleted => "deleted",
    }
}

text_enum! {
    MessageType {
        Text => "text",
        System => "system",
    }
}

text_enum! {
    /// What an audit log row records.
    AuditAction {
        ConversationCreated => "conversation_created",
        ConversationArchived => "conversation_archived",
        MemberJoined => "member_joined",
        MemberInvited => "member_invited",
        MemberLeft => "member_left",
        MemberRemoved => "member_removed",
        MemberMuted => "member_muted",
        MemberUnmuted => "member_unmuted",
        MessageEdited => "message_edited",
        MessageDeleted => "message_deleted",
        MessagePinned => "message_pinned",
        MessageUnpinned => "message_unpinned",
        SanctionApplied => "sanction_applied",
        SanctionLifted => "sanction_lifted",
    }
}

text_enum! {
    SanctionType {
        Warn => "warn",
        Mute => "mute",
        Ban => "ban",
    }
}

/// User record owned by the identity service. The hub only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub status: UserStatus,
    pub reputation_score: i64,
    pub is_banned: bool,
    pub is_muted: bool,
}

/// Result of a successful token verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub owner_id: UserId,
    pub is_public: bool,
    pub is_archived: bool,
    pub max_members: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One of the caller's conversations with their read state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub role: MemberRole,
    pub last_message_id: Option<MessageId>,
    pub last_read_message_id: Option<MessageId>,
    /// Live messages from other members past the read pointer.
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub username: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
}

impl ConversationMember {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub author_username: String,
    pub content: String,
    pub message_type: MessageType,
    pub parent_message_id: Option<MessageId>,
    pub status: MessageStatus,
    pub is_pinned: bool,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.status == MessageStatus::Deleted
    }
}

/// One prior version of an edited message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHistoryEntry {
    pub id: i64,
    pub message_id: MessageId,
    pub old_content: String,
    pub edited_by: UserId,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub mentioned_user_id: UserId,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub reaction_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sanction {
    pub id: SanctionId,
    pub user_id: UserId,
    pub moderator_id: UserId,
    pub sanction_type: SanctionType,
    pub reason: String,
    /// `None` means the sanction applies everywhere.
    pub conversation_id: Option<ConversationId>,
    pub created_at: DateTime<Utc>,
    /// `None` means permanent until lifted.
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Sanction {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|at| at > now)
    }

    /// Whether this sanction covers the given conversation (global sanctions cover all).
    pub fn covers(&self, conversation_id: Option<ConversationId>) -> bool {
        match (self.conversation_id, conversation_id) {
            (None, _) => true,
            (Some(scope), Some(target)) => scope == target,
            (Some(_), None) => false,
        }
    }
}

/// Membership, message and moderation changes, kept for moderators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub actor_id: UserId,
    /// `None` for global actions such as an unscoped sanction.
    pub conversation_id: Option<ConversationId>,
    pub target_user_id: Option<UserId>,
    pub message_id: Option<MessageId>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: i64,
    pub user_id: UserId,
    pub session_token: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sanction(expires_at: Option<DateTime<Utc>>, is_active: bool) -> Sanction {
        Sanction {
            id: 1,
            user_id: 7,
            moderator_id: 1,
            sanction_type: SanctionType::Mute,
            reason: "spam".into(),
            conversation_id: None,
            created_at: Utc::now(),
            expires_at,
            is_active,
        }
    }

    #[test]
    fn permanent_active_sanction_is_effective() {
        assert!(sanction(None, true).is_effective(Utc::now()));
    }

    #[test]
    fn expired_or_lifted_sanction_is_not_effective() {
        let now = Utc::now();
        assert!(!sanction(Some(now - Duration::seconds(1)), true).is_effective(now));
        assert!(!sanction(None, false).is_effective(now));
        assert!(sanction(Some(now + Duration::minutes(5)), true).is_effective(now));
    }

    #[test]
    fn scoped_sanction_only_covers_its_conversation() {
        let mut s = sanction(None, true);
        assert!(s.covers(Some(3)));
        assert!(s.covers(None));

        s.conversation_id = Some(3);
        assert!(s.covers(Some(3)));
        assert!(!s.covers(Some(4)));
        assert!(!s.covers(None));
    }

    #[test]
    fn text_enums_round_trip_through_storage_form() {
        assert_eq!("super_admin".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert_eq!(ConversationKind::PrivateRoom.as_str(), "private_room");
        assert!("owner".parse::<MemberRole>().unwrap().can_moderate());
        assert!("bogus".parse::<SanctionType>().is_err());
        assert_eq!("member_removed".parse::<AuditAction>().unwrap(), AuditAction::MemberRemoved);
    }

    #[test]
    fn role_ranking() {
        assert!(!Role::User.is_moderator());
        assert!(Role::Moderator.is_moderator());
        assert!(!Role::Moderator.is_admin());
        assert!(Role::SuperAdmin.is_admin());
    }
}
