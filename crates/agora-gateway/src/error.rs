use agora_types::events::{ErrorCode, ServerEvent};
use thiserror::Error;

/// Everything a hub operation can fail with. Validation and sanction errors go
/// back to the originating session only; nothing here closes other sessions.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Validation(String),

    #[error("rate limit exceeded, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("{0}")]
    SanctionDenied(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(String),

    #[error("outbound queue full")]
    Backpressure,

    #[error("storage unavailable: {0}")]
    Persistence(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{:#}", err))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::Auth,
            Self::Validation(_) => ErrorCode::Validation,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::SanctionDenied(_) => ErrorCode::SanctionDenied,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Backpressure => ErrorCode::Backpressure,
            Self::Persistence(_) => ErrorCode::Internal,
        }
    }

    /// Error event for the session that issued `command`. Storage details stay
    /// in the server log.
    pub fn to_event(&self, command: Option<&str>) -> ServerEvent {
        let message = match self {
            Self::Persistence(_) => "internal error, try again".to_string(),
            other => other.to_string(),
        };
        ServerEvent::Error {
            code: self.code(),
            message,
            command: command.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_details_are_not_sent_to_clients() {
        let err = HubError::persistence(anyhow::anyhow!("disk I/O error at /var/lib/agora.db"));
        let ServerEvent::Error { code, message, command } = err.to_event(Some("send")) else {
            panic!("expected error event");
        };
        assert_eq!(code, ErrorCode::Internal);
        assert!(!message.contains("agora.db"));
        assert_eq!(command.as_deref(), Some("send"));
    }

    #[test]
    fn not_found_names_the_entity() {
        assert_eq!(HubError::NotFound("message").to_string(), "message not found");
        assert_eq!(HubError::NotFound("message").code(), ErrorCode::NotFound);
    }
}
