//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries. The controller records the `Display` text of whichever
//! variant ends a turn, so every message is written to be read by a person.

use thiserror::Error;

/// Errors that can occur while requesting or streaming a completion.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The configured endpoint is not a valid URL.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// TCP/HTTP connection to the completion endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not respond within the configured timeout.
    #[error("request timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response. `body` is the fully drained response body.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The byte stream failed after the response headers arrived.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The secret supplier had no API credential to give.
    #[error("no API key available from {source_name}")]
    MissingCredential { source_name: String },
}

impl InferenceError {
    /// HTTP status code, if this is an `HttpError`.
    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether the failure happened on the wire rather than in local setup.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::StreamError { .. }
        )
    }
}
