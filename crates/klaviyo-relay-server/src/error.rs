//! Error types for the server.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use klaviyo_relay_auth::AuthError;

/// Error code returned while no session is loaded.
pub const NOT_LOADED: &str = "NOT_LOADED";

/// Server error type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No session has been materialized, or the last load failed.
    #[error("No session loaded")]
    NotLoaded,

    /// Bad request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Loading the Credential Store failed.
    #[error("Reload failed: {0}")]
    ReloadFailed(String),

    /// Login, store or session error.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ServerError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::NotLoaded => (StatusCode::SERVICE_UNAVAILABLE, NOT_LOADED),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
            }
            ServerError::ReloadFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "reload_failed"),
            ServerError::Auth(_) => (StatusCode::INTERNAL_SERVER_ERROR, "session_error"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ServerError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.to_string();

        if status.is_server_error() && !matches!(self, ServerError::NotLoaded) {
            tracing::error!(status = %status, code, error = %message, "Server error");
        } else {
            tracing::warn!(status = %status, code, error = %message, "Client error");
        }

        let body = ErrorResponse {
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
