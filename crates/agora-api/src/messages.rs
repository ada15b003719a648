use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use agora_types::models::Principal;
use agora_types::{ConversationId, MessageId};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Only messages with a smaller id, for paging backwards.
    pub before: Option<MessageId>,
    pub limit: Option<u32>,
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.conversations(&principal).await?))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .hub
        .history(&principal, conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_pinned(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.pinned(&principal, conversation_id).await?))
}

pub async fn get_members(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.members(&principal, conversation_id).await?))
}

pub async fn get_edit_history(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.message_history(&principal, message_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct MentionQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<u32>,
}

pub async fn get_mentions(
    State(state): State<AppState>,
    Query(query): Query<MentionQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let mentions = state
        .hub
        .mentions(&principal, query.unread_only, query.limit)
        .await?;
    Ok(Json(mentions))
}
