use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use civic_sync_core::Error as CoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl From<CoreError> for AppError {
    fn from(error: CoreError) -> Self {
        let message = error.to_string();
        match error {
            CoreError::Validation(_) | CoreError::InvalidPageToken(_) => Self::BadRequest(message),
            CoreError::AuthorizationDenied(_) => Self::Forbidden(message),
            CoreError::NotFound(_) => Self::NotFound(message),
            CoreError::StaleResolution { .. } | CoreError::UniquenessViolation(_) => {
                Self::Conflict(message)
            }
            CoreError::SessionTimeout(_) => Self::Timeout(message),
            CoreError::Store(_)
            | CoreError::LibSql(_)
            | CoreError::Serialization(_)
            | CoreError::Database(_) => {
                tracing::error!(error = %message, "sync request failed");
                Self::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (CoreError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                CoreError::InvalidPageToken("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CoreError::AuthorizationDenied("report".to_string()),
                StatusCode::FORBIDDEN,
            ),
            (CoreError::not_found("conflict"), StatusCode::NOT_FOUND),
            (
                CoreError::StaleResolution {
                    conflict_id: "c".to_string(),
                    server_version: 9,
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::SessionTimeout(Duration::from_millis(30_000)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                CoreError::Database("row".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(AppError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn sub_second_timeout_keeps_its_budget_in_the_message() {
        let error = AppError::from(CoreError::SessionTimeout(Duration::from_millis(200)));
        assert!(error.to_string().contains("200ms"), "{error}");
    }
}
