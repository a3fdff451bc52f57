// ABOUTME: API error type mapped onto HTTP status codes and machine-readable codes
// ABOUTME: Internal details are logged with a request id and never returned to clients

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kernel_runtime::RuntimeError;
use kernel_security::EncryptionError;
use kernel_storage::StorageError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Main application error type that all handlers should return
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Too many concurrent streams")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

/// Structured error response format for API consistency
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

/// Error detail structure with machine-readable codes
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn storage_status(err: &StorageError) -> (StatusCode, &'static str) {
    match err {
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
        StorageError::Duplicate(_) => (StatusCode::CONFLICT, "DUPLICATE"),
        StorageError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        StorageError::TerminalRun(_) => (StatusCode::CONFLICT, "RUN_FINISHED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

fn storage_message(err: &StorageError) -> String {
    match err {
        StorageError::NotFound(_)
        | StorageError::Duplicate(_)
        | StorageError::InvalidInput(_)
        | StorageError::TerminalRun(_) => err.to_string(),
        _ => "Data storage error".to_string(),
    }
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Convert AppError to appropriate HTTP status code and error code
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::RateLimitExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED")
            }
            AppError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
            }
            AppError::Storage(err) => storage_status(err),
            AppError::Runtime(err) => match err {
                RuntimeError::Storage(err) => storage_status(err),
                RuntimeError::ArtifactNotFound(_) => (StatusCode::NOT_FOUND, "ARTIFACT_NOT_FOUND"),
                RuntimeError::InvalidArtifactName(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_ARTIFACT_NAME")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "RUNTIME_ERROR"),
            },
            AppError::Encryption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ENCRYPTION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Get user-friendly error message (sanitized for external consumption)
    fn to_user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Validation failed: {}", msg),
            AppError::NotFound(_) => self.to_string(),
            AppError::RateLimitExceeded { .. } => {
                "Too many open log streams. Close one and try again".to_string()
            }
            AppError::Configuration(_) => "Server configuration error".to_string(),
            AppError::Storage(err) => storage_message(err),
            AppError::Runtime(err) => match err {
                RuntimeError::Storage(err) => storage_message(err),
                RuntimeError::ArtifactNotFound(_) | RuntimeError::InvalidArtifactName(_) => {
                    err.to_string()
                }
                _ => "Run engine error".to_string(),
            },
            AppError::Encryption(_) => "Secret could not be processed".to_string(),
            AppError::Internal(_) => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();
        let user_message = self.to_user_message();

        // Server-side failures get full context in the log, everything else is expected
        if status_code.is_server_error() {
            error!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "Internal server error occurred"
            );
        } else {
            info!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "API error response"
            );
        }

        let retry_after = match &self {
            AppError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };

        let error_response = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: user_message,
                retry_after,
            },
            request_id,
        };

        let mut response = Json(error_response).into_response();
        *response.status_mut() = status_code;

        if let Some(retry_after) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from(retry_after));
        }

        response
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_not_found_maps_to_404() {
        let err = AppError::from(StorageError::NotFound("Run abc".to_string()));
        assert_eq!(err.to_status_and_code().0, StatusCode::NOT_FOUND);
        assert_eq!(err.to_user_message(), "Run abc not found");
    }

    #[test]
    fn test_internal_storage_errors_are_not_leaked() {
        let err = AppError::from(StorageError::InvalidTimestamp("yesterday".to_string()));
        assert_eq!(err.to_status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_user_message(), "Data storage error");
    }

    #[test]
    fn test_rate_limit_sets_retry_after_header() {
        let response = AppError::RateLimitExceeded { retry_after: 5 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "5");
    }

    #[test]
    fn test_duplicate_maps_to_conflict() {
        let err = AppError::from(StorageError::Duplicate("Agent name 'x'".to_string()));
        assert_eq!(err.to_status_and_code(), (StatusCode::CONFLICT, "DUPLICATE"));
    }
}
