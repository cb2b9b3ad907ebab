//! Error types for the chat subsystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::chat::core::ids::SessionId;
use crate::llm::EndpointError;

/// Failure while turning an upload into model-consumable content.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// Image bytes could not be decoded or re-encoded.
    #[error("could not read image: {0}")]
    ImageDecode(#[from] image::ImageError),
    /// Embedded image uses an encoding this build cannot decode.
    #[error("unsupported image encoding: {0}")]
    UnsupportedEncoding(String),
    /// Document could not be opened or parsed.
    #[error("could not open document: {0}")]
    DocumentOpen(String),
    /// Temporary storage for the document could not be written.
    #[error("could not spool document: {0}")]
    Spool(#[from] std::io::Error),
    /// Upload payload was not valid base64.
    #[error("attachment is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<lopdf::Error> for AttachmentError {
    fn from(value: lopdf::Error) -> Self {
        Self::DocumentOpen(value.to_string())
    }
}

/// Startup configuration error. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API credential for the selected provider.
    #[error("missing API credential: set {0}")]
    MissingCredential(String),
    /// A required prompt file is missing or unreadable.
    #[error("cannot read prompt file {path}: {source}")]
    MissingPrompt {
        /// File that was looked up.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Base URL is not a URL.
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    /// Capability rule is not a valid regex.
    #[error("invalid capability pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// Chat subsystem error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// Another action is still running on this session.
    #[error("session {0} is busy with another message")]
    SessionBusy(SessionId),
    /// Registry is full.
    #[error("session limit reached ({0})")]
    SessionLimit(usize),
    /// Message was blank.
    #[error("message must not be empty")]
    EmptyMessage,
    /// Declared upload type is neither a supported image nor a PDF.
    #[error("unsupported file type: {0}")]
    UnsupportedMediaType(String),
    /// Upload exceeds the configured size limit.
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    UploadTooLarge {
        /// Upload size in bytes.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Attachment processing failed.
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    /// Completion endpoint failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// Invariant violation or task failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(format!("attachment task failed: {value}"))
    }
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
