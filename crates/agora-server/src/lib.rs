use anyhow::{Context, bail};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use agora_api::error::ApiError;
use agora_api::middleware::require_auth;
use agora_api::{AppState, messages, moderation};
use agora_gateway::{Hub, HubError, connection};

/// Secrets that ship in examples and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];
const MIN_SECRET_LEN: usize = 16;

/// Process-level settings; hub tunables live in `HubConfig`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub jwt_secret: String,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("AGORA_JWT_SECRET").context("AGORA_JWT_SECRET is required")?;
        check_jwt_secret(&jwt_secret)?;

        let port = match lookup("AGORA_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("AGORA_PORT: invalid port {:?}", raw))?,
            None => 3000,
        };

        Ok(Self {
            host: lookup("AGORA_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: lookup("AGORA_DB_PATH").unwrap_or_else(|| "agora.db".into()),
            jwt_secret,
        })
    }
}

pub fn check_jwt_secret(secret: &str) -> anyhow::Result<()> {
    if PLACEHOLDER_SECRETS.contains(&secret) {
        bail!("AGORA_JWT_SECRET is still a placeholder value");
    }
    if secret.len() < MIN_SECRET_LEN {
        bail!("AGORA_JWT_SECRET must be at least {} bytes", MIN_SECRET_LEN);
    }
    Ok(())
}

/// Full HTTP surface: authenticated REST plus the WebSocket gateway.
pub fn router(hub: Hub) -> Router {
    let state = AppState::new(hub);

    let protected_routes = Router::new()
        .route("/conversations", get(messages::get_conversations))
        .route("/conversations/{conversation_id}/messages", get(messages::get_messages))
        .route("/conversations/{conversation_id}/pins", get(messages::get_pinned))
        .route("/conversations/{conversation_id}/members", get(messages::get_members))
        .route("/conversations/{conversation_id}/audit", get(moderation::conversation_audit))
        .route(
            "/conversations/{conversation_id}/members/{user_id}/mute",
            put(moderation::set_member_muted),
        )
        .route("/messages/{message_id}/history", get(messages::get_edit_history))
        .route("/mentions", get(messages::get_mentions))
        .route("/moderation/sanctions", post(moderation::apply_sanction))
        .route("/moderation/sanctions/{sanction_id}/lift", post(moderation::lift_sanction))
        .route("/moderation/users/{user_id}/sanctions", get(moderation::user_sanctions))
        .route("/moderation/audit", get(moderation::audit_log))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come in the query string.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = query.token.or(bearer) else {
        debug!("gateway upgrade without token");
        return ApiError(HubError::Auth("missing token".into())).into_response();
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, hub, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn secret_is_required_and_not_a_placeholder() {
        assert!(ServerConfig::from_lookup(lookup(&[])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("AGORA_JWT_SECRET", "dev-secret-change-me")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("AGORA_JWT_SECRET", "short")])).is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config =
            ServerConfig::from_lookup(lookup(&[("AGORA_JWT_SECRET", "a-properly-long-secret")])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, "agora.db");
    }

    #[test]
    fn bad_port_is_an_error() {
        let result = ServerConfig::from_lookup(lookup(&[
            ("AGORA_JWT_SECRET", "a-properly-long-secret"),
            ("AGORA_PORT", "http"),
        ]));
        assert!(result.is_err());
    }
}
