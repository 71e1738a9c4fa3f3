//! HTTP error types for the Envo server.
//!
//! Maps [`CoreError`] into HTTP responses. Every variant produces a JSON
//! body with a machine-readable `error` field and a human-readable
//! `message`. Internal and encryption failures are logged and answered
//! with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use envo_core::CoreError;
use serde::Serialize;

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Missing, invalid or expired credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A tier limit blocks the creation.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Client sent invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error (storage, crypto, provider).
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::QuotaExceeded(msg) => (StatusCode::PAYMENT_REQUIRED, "quota_exceeded", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Authentication(_) => Self::Unauthorized(err.to_string()),
            CoreError::Authorization(_) => Self::Forbidden(err.to_string()),
            CoreError::QuotaExceeded { .. } => Self::QuotaExceeded(err.to_string()),
            CoreError::Validation(msg) => Self::BadRequest(msg),
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            CoreError::Encryption(_) | CoreError::Internal(_) | CoreError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use envo_core::EncryptionError;

    fn status_of(err: CoreError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn core_errors_map_to_statuses() {
        assert_eq!(status_of(CoreError::Authentication("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(CoreError::Authorization("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(CoreError::QuotaExceeded { resource: "projects", limit: 1 }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(status_of(CoreError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CoreError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CoreError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(CoreError::Encryption(EncryptionError::Decryption { reason: "tag".into() })),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::from(CoreError::Internal("pool exhausted at 10.0.0.5".into()));
        assert!(matches!(&err, AppError::Internal(msg) if msg.contains("pool exhausted")));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
