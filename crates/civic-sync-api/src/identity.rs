use axum::http::{HeaderMap, HeaderName};
use civic_sync_core::models::validate_identifier;

use crate::error::AppError;

/// Caller identity as asserted by the upstream gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

pub fn extract_user(headers: &HeaderMap, header: &HeaderName) -> Result<AuthenticatedUser, AppError> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("Missing {header} header")))?
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("{header} header is not valid UTF-8")))?
        .trim();

    validate_identifier(header.as_str(), value)
        .map_err(|error| AppError::unauthorized(error.to_string()))?;

    Ok(AuthenticatedUser {
        user_id: value.to_string(),
    })
}
