//! Error types for the edge server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shield_guard::{ErrorBody, GuardError};
use thiserror::Error;

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the edge server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// Resource not found.
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Caller is not an admin identity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Admission pipeline failure.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_, _) => (StatusCode::NOT_FOUND, "not_found"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::Guard(GuardError::Store(_)) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            Self::Guard(GuardError::Config(_)) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::BindFailed(_, _) | Self::Guard(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody::new(kind, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use shield_guard::StoreError;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_error_response() {
        let response = ServerError::NotFound("blacklist entry".into(), "1.2.3.4".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_forbidden_error_response() {
        let response = ServerError::Forbidden("admin only".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_store_failure_hides_details() {
        let err: ServerError = GuardError::from(StoreError::Connection("redis:6379 refused".into())).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["error"], "store_unavailable");
        assert!(!json["message"].as_str().unwrap().contains("redis"));
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::InvalidRequest("bad param".to_string());
        assert_eq!(err.to_string(), "invalid request: bad param");
    }
}
