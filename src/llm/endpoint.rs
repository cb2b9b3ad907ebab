//! Completion endpoint boundary and its wire types.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::chat::core::Role;
use crate::llm::error::EndpointError;

/// Boxed future type for endpoint operations.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Incremental text fragments, terminated by end-of-stream or an error.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, EndpointError>> + Send>>;

/// A remote chat-completion endpoint in streaming mode.
pub trait CompletionEndpoint: Send + Sync {
    /// Open a streaming completion.
    ///
    /// # Errors
    /// Returns an error if the request is rejected before any fragment arrives.
    /// Failures after that are yielded by the stream itself.
    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> EndpointFuture<'a, Result<FragmentStream, EndpointError>>;
}

/// Request body for `POST /chat/completions`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Model identifier.
    pub model: String,
    /// Ordered conversation.
    pub messages: Vec<OutboundMessage>,
    /// Always `true` for this client.
    pub stream: bool,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Max output tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One role/content pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    /// Speaker.
    pub role: Role,
    /// Text or multimodal parts.
    pub content: MessageContent,
}

impl OutboundMessage {
    /// Plain text message.
    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Message content as the API expects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Bare string.
    Text(String),
    /// Array of typed parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text of the content, ignoring non-text parts.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Typed content part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part.
    Text {
        /// Text.
        text: String,
    },
    /// Image reference part.
    ImageUrl {
        /// Reference, here always a `data:` URL.
        image_url: ImageUrl,
    },
}

/// Image reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    /// `data:image/png;base64,...`
    pub url: String,
}

/// One streamed chunk.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    /// Choices; usually one, empty on usage-only chunks.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// In-band error object.
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

/// Choice inside a chunk.
#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    /// Incremental delta.
    #[serde(default)]
    pub delta: ChunkDelta,
}

/// Incremental delta.
#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    /// Text fragment, if any.
    #[serde(default)]
    pub content: Option<String>,
}

/// Error object used by OpenAI-compatible APIs.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Wrapper used in non-2xx bodies: `{"error": {...}}`.
#[derive(Debug, Deserialize)]
pub struct ApiErrorEnvelope {
    /// The error.
    pub error: ApiErrorBody,
}

/// Extract the fragment carried by a raw `data:` payload.
///
/// # Errors
/// Returns an error if the payload is not JSON or carries an error object.
pub fn fragment_from_payload(payload: &str) -> Result<Option<String>, EndpointError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)?;
    if let Some(error) = chunk.error {
        return Err(EndpointError::Api(error.message));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}
