pub mod api;
pub mod events;
pub mod models;

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;
pub type SanctionId = i64;

/// Identifies one live WebSocket connection. A user may hold several.
pub type SessionId = uuid::Uuid;
