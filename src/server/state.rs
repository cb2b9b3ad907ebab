//! Application state shared across all request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::chat::core::{AppConfig, ConfigError, ProviderKind};
use crate::chat::{ChatController, SessionRegistry};
use crate::llm::{CompletionEndpoint, EndpointError, OpenAiCompatClient};

/// Errors raised while assembling the application state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Completion client could not be built.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Exchange driver.
    pub controller: ChatController,
    /// Live sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Page title.
    pub title: String,
    /// Provider in use.
    pub provider: ProviderKind,
    /// Static front-end directory.
    pub static_dir: PathBuf,
    /// Max accepted upload, decoded.
    pub max_upload_bytes: usize,
}

impl AppState {
    /// State backed by the OpenAI-compatible client.
    ///
    /// # Errors
    /// Returns an error if the client or the capability table cannot be built.
    pub fn new(config: &AppConfig) -> Result<Arc<Self>, StateError> {
        let endpoint = Arc::new(OpenAiCompatClient::new(&config.provider)?);
        Self::with_endpoint(config, endpoint)
    }

    /// State backed by any completion endpoint.
    ///
    /// # Errors
    /// Returns an error if the capability table cannot be built.
    pub fn with_endpoint(
        config: &AppConfig,
        endpoint: Arc<dyn CompletionEndpoint>,
    ) -> Result<Arc<Self>, StateError> {
        let controller = ChatController::from_config(config, endpoint)?;
        Ok(Arc::new(Self {
            controller,
            sessions: Arc::new(SessionRegistry::new(&config.sessions)),
            title: config.prompts.title.clone(),
            provider: config.provider.kind,
            static_dir: config.server.static_dir.clone(),
            max_upload_bytes: config.attachments.max_upload_bytes,
        }))
    }
}
