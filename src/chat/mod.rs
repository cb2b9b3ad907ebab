//! Chat sessions: transcripts, attachments, request building and the
//! controller that drives each exchange.

pub mod attachment;
pub mod capabilities;
pub mod controller;
pub mod core;
pub mod document;
pub mod request_builder;
pub mod sessions;
pub mod transcript;

pub use attachment::{AttachmentKind, AttachmentPreview, AttachmentProcessor, Upload};
pub use capabilities::CapabilityTable;
pub use controller::{ChatController, ExchangeOutcome, ExchangeResult};
pub use self::core::{AppConfig, ChatError, ChatResult, ConfigError, Role, SessionId, Turn, TurnContent};
pub use document::{DocumentExtractor, LopdfExtractor};
pub use request_builder::RequestBuilder;
pub use sessions::{SessionRegistry, SessionSweeper};
pub use transcript::{ExchangeState, Session, Transcript};
