use serde::{Deserialize, Serialize};

use crate::models::{Message, Role, SanctionType};
use crate::{ConversationId, UserId};

// -- JWT Claims --

/// JWT claims shared by agora-api (REST middleware) and agora-gateway
/// (WebSocket authentication). Issued by the external identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub exp: usize,
}

fn default_role() -> Role {
    Role::User
}

// -- Messages --

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    #[serde(flatten)]
    pub message: Message,
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub reaction_type: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}

// -- Moderation --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplySanctionRequest {
    pub user_id: UserId,
    pub sanction_type: SanctionType,
    pub reason: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Omit for a permanent sanction.
    #[serde(default)]
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetMutedRequest {
    pub muted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
