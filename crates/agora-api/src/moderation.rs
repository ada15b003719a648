use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use agora_types::api::{ApplySanctionRequest, SetMutedRequest};
use agora_types::models::Principal;
use agora_types::{ConversationId, SanctionId, UserId};

use crate::AppState;
use crate::error::ApiError;

pub async fn apply_sanction(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ApplySanctionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sanction = state.hub.apply_sanction(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(sanction)))
}

pub async fn lift_sanction(
    State(state): State<AppState>,
    Path(sanction_id): Path<SanctionId>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.lift_sanction(&principal, sanction_id).await?))
}

pub async fn user_sanctions(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.sanctions_for_user(&principal, user_id).await?))
}

pub async fn set_member_muted(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(ConversationId, UserId)>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SetMutedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .hub
        .set_member_muted(&principal, conversation_id, user_id, req.muted)
        .await?;
    Ok(Json(member))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// Only entries with a smaller id, for paging backwards.
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn conversation_audit(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<AuditQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .hub
        .audit_log(&principal, Some(conversation_id), query.before, query.limit)
        .await?;
    Ok(Json(entries))
}

pub async fn audit_log(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .hub
        .audit_log(&principal, None, query.before, query.limit)
        .await?;
    Ok(Json(entries))
}
