//! Builds outbound completion requests from a transcript.

use crate::chat::core::{
    AppConfig, AttachmentHistory, SamplingConfig, SamplingParams, Turn, TurnContent,
};
use crate::chat::transcript::Transcript;
use crate::llm::{CompletionRequest, ContentPart, ImageUrl, MessageContent, OutboundMessage};

/// Heading placed between the user message and the document text.
const DOCUMENT_HEADING: &str = "Document content:";

/// Kind of the exchange, from the current turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Plain text.
    Text,
    /// Text with an image.
    Image,
    /// Text with a document.
    Document,
}

impl ExchangeKind {
    /// Kind of a turn's content.
    #[must_use]
    pub const fn of(content: &TurnContent) -> Self {
        match content {
            TurnContent::Text { .. } => Self::Text,
            TurnContent::WithImage { .. } => Self::Image,
            TurnContent::WithDocument { .. } => Self::Document,
        }
    }
}

/// Turns a transcript into a [`CompletionRequest`].
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    model: String,
    sampling: SamplingConfig,
    document_char_budget: usize,
    history: AttachmentHistory,
}

impl RequestBuilder {
    /// Builder from explicit settings.
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        sampling: SamplingConfig,
        document_char_budget: usize,
        history: AttachmentHistory,
    ) -> Self {
        Self {
            model: model.into(),
            sampling,
            document_char_budget,
            history,
        }
    }

    /// Builder from the application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.model.clone(),
            config.sampling.clone(),
            config.attachments.document_char_budget,
            config.attachments.history,
        )
    }

    /// Model identifier.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sampling for an exchange kind.
    #[must_use]
    pub const fn sampling_for(&self, kind: ExchangeKind) -> SamplingParams {
        match kind {
            ExchangeKind::Text => self.sampling.text,
            ExchangeKind::Image => self.sampling.image,
            ExchangeKind::Document => self.sampling.document,
        }
    }

    /// Build the request for the transcript's last turn.
    ///
    /// Only the last turn gets rich content; earlier attachment turns follow
    /// the history policy. The transcript is not modified.
    #[must_use]
    pub fn build(&self, transcript: &Transcript) -> CompletionRequest {
        let turns = transcript.all();
        let kind = turns
            .last()
            .map_or(ExchangeKind::Text, |turn| ExchangeKind::of(&turn.content));

        let mut messages = Vec::with_capacity(turns.len());
        if let Some((current, earlier)) = turns.split_last() {
            messages.extend(earlier.iter().filter_map(|turn| self.history_message(turn)));
            messages.push(self.current_message(current));
        }

        let sampling = self.sampling_for(kind);
        CompletionRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        }
    }

    fn history_message(&self, turn: &Turn) -> Option<OutboundMessage> {
        if turn.content.has_attachment() && self.history == AttachmentHistory::Omit {
            return None;
        }
        Some(OutboundMessage::text(turn.role, turn.text()))
    }

    fn current_message(&self, turn: &Turn) -> OutboundMessage {
        let content = match &turn.content {
            TurnContent::Text { text } => MessageContent::Text(text.clone()),
            TurnContent::WithImage { text, image } => MessageContent::Parts(vec![
                ContentPart::Text { text: text.clone() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image.data_url(),
                    },
                },
            ]),
            TurnContent::WithDocument { text, document } => {
                let excerpt = truncate_chars(&document.text, self.document_char_budget);
                MessageContent::Text(format!("{text}\n\n{DOCUMENT_HEADING}\n{excerpt}"))
            }
        };
        OutboundMessage {
            role: turn.role,
            content,
        }
    }
}

/// First `max_chars` Unicode scalar values of `text`.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::core::{EncodedImage, ExtractedDocument, Role};

    fn builder(history: AttachmentHistory) -> RequestBuilder {
        RequestBuilder::new("gpt-4o", SamplingConfig::default(), 4000, history)
    }

    fn image() -> EncodedImage {
        EncodedImage {
            width: 1,
            height: 1,
            png_base64: "iVBOR".to_string(),
        }
    }

    fn document(text: String) -> ExtractedDocument {
        ExtractedDocument {
            text,
            ..ExtractedDocument::default()
        }
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user("what is rust?"));
        let request = builder(AttachmentHistory::TextOnly).build(&transcript);

        assert_eq!(request.model, "gpt-4o");
        assert!(request.stream);
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Assistant, Role::User]);
        assert_eq!(
            request.messages[2].content,
            MessageContent::Text("what is rust?".to_string())
        );
        assert_eq!(request.max_tokens, None);
    }

    #[test]
    fn test_current_image_becomes_parts() {
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user_with_image("describe", image()));
        let request = builder(AttachmentHistory::TextOnly).build(&transcript);

        let MessageContent::Parts(parts) = &request.messages[2].content else {
            panic!("expected parts");
        };
        assert_eq!(
            parts[1],
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,iVBOR".to_string()
                }
            }
        );
        assert_eq!(request.max_tokens, Some(1000));
    }

    #[test]
    fn test_document_is_truncated_in_request_only() {
        let full = "a".repeat(5000);
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user_with_document("summarize", document(full.clone())));
        let request = builder(AttachmentHistory::TextOnly).build(&transcript);

        let sent = request.messages[2].content.text();
        assert_eq!(sent, format!("summarize\n\nDocument content:\n{}", "a".repeat(4000)));
        assert_eq!(request.max_tokens, Some(1500));

        let TurnContent::WithDocument { document, .. } = &transcript.all()[2].content else {
            panic!("expected document turn");
        };
        assert_eq!(document.text.len(), 5000);
    }

    #[test]
    fn test_truncation_counts_characters() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_history_policy_text_only() {
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user_with_image("look at this", image()));
        transcript.append(Turn::assistant("a cat"));
        transcript.append(Turn::user("thanks"));
        let request = builder(AttachmentHistory::TextOnly).build(&transcript);

        assert_eq!(request.messages.len(), 5);
        assert_eq!(
            request.messages[2].content,
            MessageContent::Text("look at this".to_string())
        );
    }

    #[test]
    fn test_history_policy_omit() {
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user_with_document("read", document("body".to_string())));
        transcript.append(Turn::assistant("summary"));
        transcript.append(Turn::user("more?"));
        let request = builder(AttachmentHistory::Omit).build(&transcript);

        let texts: Vec<String> = request.messages.iter().map(|m| m.content.text()).collect();
        assert_eq!(texts, vec!["persona", "hello", "summary", "more?"]);
    }

    #[test]
    fn test_sampling_from_config() {
        let mut config = AppConfig::default();
        config.model = "deepseek-chat".to_string();
        config.sampling = SamplingConfig::for_provider(crate::chat::core::ProviderKind::DeepSeek);
        let builder = RequestBuilder::from_config(&config);

        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user("hi"));
        let request = builder.build(&transcript);
        assert_eq!(request.model, "deepseek-chat");
        assert_eq!(request.temperature, Some(0.7));
    }
}
