//! Turn model for chat transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::chat::core::ids::TurnId;

/// Role of a transcript turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Persona / instructions. Never rendered.
    System,
    /// Model output.
    Assistant,
    /// End-user input.
    User,
}

impl Role {
    /// Stable wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "user" => Ok(Self::User),
            _ => Err(value.to_string()),
        }
    }
}

/// An image ready for display and for transmission: PNG bytes, base64 encoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncodedImage {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Base64 (standard alphabet) PNG payload.
    pub png_base64: String,
}

impl EncodedImage {
    /// `data:` URL form used by multimodal chat requests.
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.png_base64)
    }
}

/// Image extracted from a document page.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DocumentImage {
    /// 1-based page number.
    pub page: u32,
    /// Position of the image on its page.
    pub index: usize,
    /// Decoded image.
    pub image: EncodedImage,
}

/// An embedded image that could not be decoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageFailure {
    /// 1-based page number.
    pub page: u32,
    /// Position of the image on its page.
    pub index: usize,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for ImageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not decode image {} on page {}: {}",
            self.index + 1,
            self.page,
            self.reason
        )
    }
}

/// Result of extracting a document.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    /// Full plain text, pages separated by a blank line.
    pub text: String,
    /// Successfully decoded images in document order.
    pub images: Vec<DocumentImage>,
    /// Images that were skipped.
    pub failures: Vec<ImageFailure>,
}

/// Content of a turn.
///
/// Attachments are carried as explicit variants instead of optional keys, so
/// request building dispatches on the variant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
    /// Text with one inline image.
    WithImage {
        /// Message text.
        text: String,
        /// The uploaded image.
        image: EncodedImage,
    },
    /// Text with an extracted document.
    WithDocument {
        /// Message text.
        text: String,
        /// Untruncated extraction result.
        document: ExtractedDocument,
    },
}

impl TurnContent {
    /// The message text regardless of variant.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } | Self::WithImage { text, .. } | Self::WithDocument { text, .. } => {
                text
            }
        }
    }

    /// Whether the content carries an attachment.
    #[must_use]
    pub const fn has_attachment(&self) -> bool {
        !matches!(self, Self::Text { .. })
    }
}

/// One message unit in a transcript.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Turn identifier.
    pub id: TurnId,
    /// Who produced the turn.
    pub role: Role,
    /// Payload.
    pub content: TurnContent,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn build(role: Role, content: TurnContent) -> Self {
        Self {
            id: TurnId::new(),
            role,
            content,
            created_at: Utc::now(),
        }
    }

    /// Build a system turn.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::build(Role::System, TurnContent::Text { text: text.into() })
    }

    /// Build a plain assistant turn.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(Role::Assistant, TurnContent::Text { text: text.into() })
    }

    /// Build a plain user turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::build(Role::User, TurnContent::Text { text: text.into() })
    }

    /// Build a user turn carrying an image.
    #[must_use]
    pub fn user_with_image(text: impl Into<String>, image: EncodedImage) -> Self {
        Self::build(
            Role::User,
            TurnContent::WithImage {
                text: text.into(),
                image,
            },
        )
    }

    /// Build a user turn carrying an extracted document.
    #[must_use]
    pub fn user_with_document(text: impl Into<String>, document: ExtractedDocument) -> Self {
        Self::build(
            Role::User,
            TurnContent::WithDocument {
                text: text.into(),
                document,
            },
        )
    }

    /// Shortcut for the message text.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.text()
    }
}
