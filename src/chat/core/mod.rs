//! Core types shared by the chat subsystem.

pub mod config;
pub mod errors;
pub mod ids;
pub mod turn;

pub use config::{
    AppConfig, AttachmentConfig, AttachmentHistory, CapabilityConfig, CapabilityRule,
    ModelCapabilities, PromptConfig, ProviderConfig, ProviderKind, SamplingConfig,
    SamplingParams, ServerConfig, SessionConfig,
};
pub use errors::{AttachmentError, ChatError, ChatResult, ConfigError};
pub use ids::{SessionId, TurnId};
pub use turn::{
    DocumentImage, EncodedImage, ExtractedDocument, ImageFailure, Role, Turn, TurnContent,
};
