//! Error types for completion endpoints.

use thiserror::Error;

/// Errors raised while talking to a completion endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Connection, TLS, timeout or body read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credential rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Too many requests.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited {
        /// Seconds from the `Retry-After` header, when sent.
        retry_after: Option<u64>,
    },

    /// Any other non-success status.
    #[error("endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or extracted error message.
        body: String,
    },

    /// Error object delivered inside the stream.
    #[error("endpoint reported an error: {0}")]
    Api(String),

    /// Stream chunk was not valid JSON.
    #[error("malformed stream chunk: {0}")]
    MalformedChunk(#[from] serde_json::Error),

    /// Client could not be configured.
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),
}

impl EndpointError {
    /// Check if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    retry_after.map_or_else(String::new, |secs| format!(", retry after {secs} seconds"))
}
