//! Chat session controller: drives one exchange per user action.
//!
//! Flow: accept input, mutate the transcript, call the endpoint, accumulate
//! the streamed reply, mutate the transcript again. Failures end the exchange
//! with a visible error and leave the session usable.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chat::attachment::{AttachmentKind, AttachmentProcessor, ProcessedAttachment, Upload};
use crate::chat::capabilities::CapabilityTable;
use crate::chat::core::{AppConfig, ChatError, ChatResult, ConfigError, PromptConfig, Turn};
use crate::chat::request_builder::RequestBuilder;
use crate::chat::transcript::{ExchangeState, Session};
use crate::llm::CompletionEndpoint;

/// How an exchange ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// The model replied; an assistant turn was appended.
    Completed,
    /// The model cannot handle the attachment; the fixed reply was appended.
    Fallback,
    /// Attachment or endpoint failure; no assistant turn was appended.
    Failed,
}

/// Result of one user action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExchangeResult {
    /// How it ended.
    pub outcome: ExchangeOutcome,
    /// Appended assistant text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    /// Human-readable failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal warnings, e.g. skipped document images.
    pub notices: Vec<String>,
}

impl ExchangeResult {
    fn completed(reply: String, notices: Vec<String>) -> Self {
        Self {
            outcome: ExchangeOutcome::Completed,
            reply: Some(reply),
            error: None,
            notices,
        }
    }

    fn fallback(reply: String, notices: Vec<String>) -> Self {
        Self {
            outcome: ExchangeOutcome::Fallback,
            reply: Some(reply),
            error: None,
            notices,
        }
    }

    fn failed(error: String, notices: Vec<String>) -> Self {
        Self {
            outcome: ExchangeOutcome::Failed,
            reply: None,
            error: Some(error),
            notices,
        }
    }
}

/// Executes exchanges against a completion endpoint.
#[derive(Clone)]
pub struct ChatController {
    endpoint: Arc<dyn CompletionEndpoint>,
    builder: RequestBuilder,
    capabilities: CapabilityTable,
    attachments: AttachmentProcessor,
    prompts: PromptConfig,
}

impl std::fmt::Debug for ChatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatController")
            .field("model", &self.builder.model())
            .finish_non_exhaustive()
    }
}

impl ChatController {
    /// Assemble a controller from its parts.
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn CompletionEndpoint>,
        builder: RequestBuilder,
        capabilities: CapabilityTable,
        attachments: AttachmentProcessor,
        prompts: PromptConfig,
    ) -> Self {
        Self {
            endpoint,
            builder,
            capabilities,
            attachments,
            prompts,
        }
    }

    /// Controller for `config`, with a `lopdf`-backed attachment processor.
    ///
    /// # Errors
    /// Returns an error if the capability table does not compile.
    pub fn from_config(
        config: &AppConfig,
        endpoint: Arc<dyn CompletionEndpoint>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            endpoint,
            RequestBuilder::from_config(config),
            CapabilityTable::from_config(&config.capabilities)?,
            AttachmentProcessor::with_lopdf(config.attachments.clone()),
            config.prompts.clone(),
        ))
    }

    /// Model identifier in use.
    #[must_use]
    pub fn model(&self) -> &str {
        self.builder.model()
    }

    /// Whether the configured model accepts images.
    #[must_use]
    pub fn supports_vision(&self) -> bool {
        self.capabilities.supports_vision(self.builder.model())
    }

    /// Prompts and fixed texts.
    #[must_use]
    pub const fn prompts(&self) -> &PromptConfig {
        &self.prompts
    }

    /// Attachment processor, for previews.
    #[must_use]
    pub const fn attachments(&self) -> &AttachmentProcessor {
        &self.attachments
    }

    /// A fresh session seeded with the persona and greeting.
    #[must_use]
    pub fn new_session(&self) -> Session {
        Session::new(&self.prompts.system, &self.prompts.greeting)
    }

    /// Handle a plain text message.
    ///
    /// # Errors
    /// `EmptyMessage` for blank input. Endpoint failures are reported in the
    /// result, not as errors.
    pub async fn send_text(&self, session: &mut Session, message: &str) -> ChatResult<ExchangeResult> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        session.touch();
        session.transition(ExchangeState::AwaitingAttachmentOrText);
        session.transcript.append(Turn::user(message));
        Ok(self.complete(session, Vec::new()).await)
    }

    /// Handle an uploaded image or document, with an optional message.
    ///
    /// # Errors
    /// `UploadTooLarge` or `UnsupportedMediaType`, before anything is recorded.
    /// Decoding and endpoint failures are reported in the result.
    pub async fn send_attachment(
        &self,
        session: &mut Session,
        upload: Upload,
        message: Option<&str>,
    ) -> ChatResult<ExchangeResult> {
        let kind = self.attachments.classify(&upload)?;
        session.touch();
        session.transition(ExchangeState::AwaitingAttachmentOrText);

        let processor = self.attachments.clone();
        let processed = tokio::task::spawn_blocking(move || processor.process(&upload))
            .await
            .map_err(ChatError::from)
            .and_then(|result| result);
        let processed = match processed {
            Ok(processed) => processed,
            Err(err) => {
                warn!(session = %session.id, ?kind, "attachment rejected: {err}");
                return Ok(Self::fail(session, err.to_string(), Vec::new()));
            }
        };

        let text = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        match processed {
            ProcessedAttachment::Image(image) => {
                let text = text.unwrap_or_else(|| self.prompts.image_request.clone());
                session.transcript.append(Turn::user_with_image(text, image));

                if !self.supports_vision() {
                    info!(
                        session = %session.id,
                        model = self.model(),
                        "model cannot read images, replying with fallback"
                    );
                    let reply = self.prompts.vision_fallback.clone();
                    session.transcript.append(Turn::assistant(reply.clone()));
                    session.transition(ExchangeState::Completed);
                    session.transition(ExchangeState::Idle);
                    return Ok(ExchangeResult::fallback(reply, Vec::new()));
                }
                Ok(self.complete(session, Vec::new()).await)
            }
            ProcessedAttachment::Document(document) => {
                let notices = document.failures.iter().map(ToString::to_string).collect();
                let text = text.unwrap_or_else(|| self.prompts.document_request.clone());
                debug!(
                    session = %session.id,
                    kind = ?AttachmentKind::Document,
                    chars = document.text.chars().count(),
                    images = document.images.len(),
                    "document attached"
                );
                session.transcript.append(Turn::user_with_document(text, document));
                Ok(self.complete(session, notices).await)
            }
        }
    }

    /// Build the request, stream the reply and record it.
    async fn complete(&self, session: &mut Session, notices: Vec<String>) -> ExchangeResult {
        let request = self.builder.build(&session.transcript);
        session.transition(ExchangeState::RequestBuilt);

        let mut stream = match self.endpoint.stream_completion(&request).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(session = %session.id, "completion request failed: {err}");
                return Self::fail(session, err.to_string(), notices);
            }
        };
        session.transition(ExchangeState::Streaming);

        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => reply.push_str(&text),
                Err(err) => {
                    warn!(
                        session = %session.id,
                        received = reply.len(),
                        "completion stream failed: {err}"
                    );
                    return Self::fail(session, err.to_string(), notices);
                }
            }
        }

        session.transcript.append(Turn::assistant(reply.clone()));
        session.transition(ExchangeState::Completed);
        session.transition(ExchangeState::Idle);
        session.touch();
        ExchangeResult::completed(reply, notices)
    }

    fn fail(session: &mut Session, error: String, notices: Vec<String>) -> ExchangeResult {
        session.transition(ExchangeState::Failed);
        session.transition(ExchangeState::Idle);
        session.touch();
        ExchangeResult::failed(error, notices)
    }
}
