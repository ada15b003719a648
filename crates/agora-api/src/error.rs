use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use agora_gateway::HubError;
use agora_types::api::ErrorBody;

/// `HubError` rendered as an HTTP response with an `ErrorBody`.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::Auth(_) => StatusCode::UNAUTHORIZED,
        HubError::Validation(_) => StatusCode::BAD_REQUEST,
        HubError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        HubError::SanctionDenied(_) | HubError::Forbidden(_) => StatusCode::FORBIDDEN,
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
        HubError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = match &self.0 {
            HubError::Persistence(detail) => {
                error!("request failed: {}", detail);
                "internal error, try again".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            code: self.0.code().as_str().to_string(),
            message,
        };

        let mut response = (status, Json(body)).into_response();
        if let HubError::RateLimited { retry_after_ms } = self.0 {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        assert_eq!(status_for(&HubError::Auth("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&HubError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&HubError::SanctionDenied("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&HubError::NotFound("message")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&HubError::Persistence("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError(HubError::RateLimited { retry_after_ms: 1500 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
