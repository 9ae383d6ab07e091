//! API error handling.
//!
//! Maps crate errors onto HTTP status codes with a consistent JSON body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{Error, ErrorKind};

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::not_found(err.to_string()),
            ErrorKind::Conflict => {
                // Expected under concurrency; keep it quiet.
                tracing::debug!(error = %err, "Conflict");
                ApiError::conflict(err.to_string())
            }
            ErrorKind::Unauthorized => {
                tracing::warn!(error = %err, "Refresh rejected by provider");
                ApiError::forbidden(err.to_string())
            }
            ErrorKind::ValidationFailure => ApiError::bad_request(err.to_string()),
            ErrorKind::ServerError => match err {
                Error::DatabaseSqlx(_) | Error::Database(_) => {
                    tracing::error!(error = %err, "Database error");
                    ApiError::internal("Database error occurred")
                }
                Error::Refresh(_) | Error::Network(_) => {
                    tracing::warn!(error = %err, "Refresh failed");
                    ApiError::internal(err.to_string())
                }
                _ => {
                    tracing::error!(error = %err, "Unexpected error");
                    ApiError::internal("An unexpected error occurred")
                }
            },
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
