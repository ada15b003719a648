use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use sha2::{Digest, Sha256};

use agora_types::UserId;
use agora_types::api::Claims;
use agora_types::models::{Principal, Role};

use crate::error::{HubError, HubResult};

/// Resolves a bearer token to a principal. Called once per connection and
/// again on `refresh_token`; never per message.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> HubResult<Principal>;
}

/// HS256 JWTs issued by the identity service with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl AuthVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> HubResult<Principal> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| HubError::Auth(e.to_string()))?;
        let claims = data.claims;

        let expires_at = i64::try_from(claims.exp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| HubError::Auth("exp out of range".into()))?;

        Ok(Principal {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
            expires_at,
        })
    }
}

/// Mint a token the way the identity service does. Used by tooling and tests.
pub fn issue_token(
    secret: &str,
    user_id: UserId,
    username: &str,
    role: Role,
    ttl: Duration,
) -> anyhow::Result<String> {
    let exp = (Utc::now() + ttl).timestamp();
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: usize::try_from(exp)?,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Bearer tokens are never stored; `user_sessions` keys on this digest.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
