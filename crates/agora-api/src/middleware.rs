use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use agora_gateway::HubError;

use crate::AppState;
use crate::error::ApiError;

/// Verify the bearer token, refuse logged-out sessions, and stash the
/// resulting `Principal` in the request extensions for handlers to pick up.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| HubError::Auth("missing bearer token".into()))?;

    let principal = state.hub.authenticate(token).await?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
