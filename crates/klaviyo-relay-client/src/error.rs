//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The relay has no session loaded.
    #[error("Relay has no session loaded")]
    NotLoaded,

    /// The relay itself returned an error.
    #[error("Relay error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error code from the relay.
        code: String,
        /// Error message from the relay.
        message: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Error::NotLoaded)
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::Api { status: 429, .. })
    }

    /// Check if this is a server error.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Api { status, .. } if *status >= 500)
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error body produced by the relay.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ErrorResponse {
    pub code: String,
    pub message: String,
}
