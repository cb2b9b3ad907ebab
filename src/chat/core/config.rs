//! Configuration for the chat relay.
//!
//! Everything here is loaded once at startup and treated as immutable
//! afterwards. `AppConfig::from_env` reads `CHAT_RELAY_*` variables and the
//! prompt files of the prompt directory.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::ConfigError;

/// Provider selection.
pub const PROVIDER_ENV: &str = "CHAT_RELAY_PROVIDER";
/// API credential (falls back to the provider-specific variable).
pub const API_KEY_ENV: &str = "CHAT_RELAY_API_KEY";
/// Custom base URL for the completion endpoint.
pub const BASE_URL_ENV: &str = "CHAT_RELAY_BASE_URL";
/// Directory holding `system.txt`, `greeting.txt`, `title.txt` and `model.txt`.
pub const PROMPT_DIR_ENV: &str = "CHAT_RELAY_PROMPT_DIR";
/// Model override.
pub const MODEL_ENV: &str = "CHAT_RELAY_MODEL";
/// Temperature override for text exchanges.
pub const TEMPERATURE_ENV: &str = "CHAT_RELAY_TEMPERATURE";
/// Max output tokens override for text exchanges.
pub const MAX_TOKENS_ENV: &str = "CHAT_RELAY_MAX_TOKENS";
/// HTTP port.
pub const PORT_ENV: &str = "CHAT_RELAY_PORT";
/// Static front-end directory.
pub const STATIC_DIR_ENV: &str = "CHAT_RELAY_STATIC_DIR";
/// Idle session lifetime in seconds.
pub const SESSION_TTL_ENV: &str = "CHAT_RELAY_SESSION_TTL_SECS";
/// Maximum number of live sessions.
pub const MAX_SESSIONS_ENV: &str = "CHAT_RELAY_MAX_SESSIONS";
/// Character budget for document text sent to the model.
pub const DOCUMENT_BUDGET_ENV: &str = "CHAT_RELAY_DOCUMENT_BUDGET";
/// How earlier attachment turns are replayed.
pub const HISTORY_POLICY_ENV: &str = "CHAT_RELAY_HISTORY_POLICY";
/// Cap on the decoded size of one embedded document image.
pub const MAX_IMAGE_BYTES_ENV: &str = "CHAT_RELAY_MAX_IMAGE_BYTES";

const DEFAULT_PROMPT_DIR: &str = "prompts";
const SYSTEM_PROMPT_FILE: &str = "system.txt";
const GREETING_FILE: &str = "greeting.txt";
const TITLE_FILE: &str = "title.txt";
const MODEL_FILE: &str = "model.txt";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion provider settings.
    pub provider: ProviderConfig,
    /// Model identifier sent with every request.
    pub model: String,
    /// Sampling parameters per exchange kind.
    pub sampling: SamplingConfig,
    /// Persona, greeting and fixed texts.
    pub prompts: PromptConfig,
    /// Upload handling.
    pub attachments: AttachmentConfig,
    /// Model capability table.
    pub capabilities: CapabilityConfig,
    /// Session lifecycle.
    pub sessions: SessionConfig,
    /// HTTP surface.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Returns an error if the credential or persona is missing, or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns an error if the credential or persona is missing, or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = match lookup(PROVIDER_ENV) {
            Some(raw) => raw.parse::<ProviderKind>()?,
            None => ProviderKind::default(),
        };

        let prompt_dir =
            PathBuf::from(lookup(PROMPT_DIR_ENV).unwrap_or_else(|| DEFAULT_PROMPT_DIR.to_string()));
        let system = read_required(&prompt_dir.join(SYSTEM_PROMPT_FILE))?;
        let defaults = PromptConfig::default();
        let prompts = PromptConfig {
            system,
            greeting: read_optional(&prompt_dir.join(GREETING_FILE))?
                .unwrap_or(defaults.greeting.clone()),
            title: read_optional(&prompt_dir.join(TITLE_FILE))?
                .map(|t| t.trim().to_string())
                .unwrap_or(defaults.title.clone()),
            ..defaults
        };

        let model = match lookup(MODEL_ENV).filter(|m| !m.trim().is_empty()) {
            Some(model) => model.trim().to_string(),
            None => read_optional(&prompt_dir.join(MODEL_FILE))?
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| kind.default_model().to_string()),
        };

        let api_key = lookup(API_KEY_ENV)
            .or_else(|| lookup(kind.credential_env()))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ConfigError::MissingCredential(format!(
                    "{API_KEY_ENV} or {}",
                    kind.credential_env()
                ))
            })?;

        let mut sampling = SamplingConfig::for_provider(kind);
        if let Some(temperature) = parse_var::<f32, _>(&lookup, TEMPERATURE_ENV)? {
            sampling.text.temperature = Some(temperature);
        }
        if let Some(max_tokens) = parse_var::<u32, _>(&lookup, MAX_TOKENS_ENV)? {
            sampling.text.max_tokens = Some(max_tokens);
        }

        let mut attachments = AttachmentConfig::default();
        if let Some(budget) = parse_var::<usize, _>(&lookup, DOCUMENT_BUDGET_ENV)? {
            attachments.document_char_budget = budget;
        }
        if let Some(policy) = parse_var::<AttachmentHistory, _>(&lookup, HISTORY_POLICY_ENV)? {
            attachments.history = policy;
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, MAX_IMAGE_BYTES_ENV)? {
            attachments.max_image_bytes = max;
        }

        let mut sessions = SessionConfig::default();
        if let Some(ttl) = parse_var::<u64, _>(&lookup, SESSION_TTL_ENV)? {
            sessions.idle_ttl_seconds = ttl;
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, MAX_SESSIONS_ENV)? {
            sessions.max_sessions = max;
        }

        let mut server = ServerConfig::default();
        if let Some(port) = parse_var::<u16, _>(&lookup, PORT_ENV)? {
            server.port = port;
        }
        if let Some(dir) = lookup(STATIC_DIR_ENV) {
            server.static_dir = PathBuf::from(dir);
        }

        let config = Self {
            provider: ProviderConfig {
                kind,
                base_url: lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()),
                api_key,
                ..ProviderConfig::default()
            },
            model,
            sampling,
            prompts,
            attachments,
            capabilities: CapabilityConfig::default(),
            sessions,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential(format!(
                "{API_KEY_ENV} or {}",
                self.provider.kind.credential_env()
            )));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }

        if self.prompts.system.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "system prompt must not be empty".to_string(),
            ));
        }

        Url::parse(&self.provider.base_url())?;

        if self.provider.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "provider.request_timeout_secs must be > 0".to_string(),
            ));
        }

        for (kind, params) in [
            ("text", &self.sampling.text),
            ("image", &self.sampling.image),
            ("document", &self.sampling.document),
        ] {
            if let Some(t) = params.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::Invalid(format!(
                        "sampling.{kind}.temperature must be within 0..=2, got {t}"
                    )));
                }
            }
            if params.max_tokens == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sampling.{kind}.max_tokens must be > 0"
                )));
            }
        }

        if self.attachments.document_char_budget == 0 {
            return Err(ConfigError::Invalid(
                "attachments.document_char_budget must be > 0".to_string(),
            ));
        }

        if self.attachments.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "attachments.max_upload_bytes must be > 0".to_string(),
            ));
        }

        if self.attachments.max_image_bytes == 0 {
            return Err(ConfigError::Invalid(
                "attachments.max_image_bytes must be > 0".to_string(),
            ));
        }

        if self.sessions.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "sessions.max_sessions must be > 0".to_string(),
            ));
        }

        if self.sessions.idle_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sessions.idle_ttl_seconds must be > 0".to_string(),
            ));
        }

        for rule in &self.capabilities.rules {
            Regex::new(&rule.pattern)?;
        }

        Ok(())
    }
}

/// Supported OpenAI-compatible providers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `OpenAI` chat completions.
    #[default]
    OpenAi,
    /// `DeepSeek` chat completions.
    DeepSeek,
}

impl ProviderKind {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
        }
    }

    /// Base URL used when none is configured.
    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::DeepSeek => "https://api.deepseek.com",
        }
    }

    /// Provider-specific credential variable.
    #[must_use]
    pub const fn credential_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Model used when neither `CHAT_RELAY_MODEL` nor `model.txt` is set.
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::DeepSeek => "deepseek-chat",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "deepseek" => Ok(Self::DeepSeek),
            other => Err(ConfigError::Invalid(format!("unknown provider: {other}"))),
        }
    }
}

/// Completion provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider.
    pub kind: ProviderKind,
    /// Optional custom base URL.
    pub base_url: Option<String>,
    /// Bearer credential. Never serialized.
    #[serde(skip_serializing, default)]
    pub api_key: String,
    /// Whole-request timeout, streaming included.
    pub request_timeout_secs: u64,
    /// Connection timeout.
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            api_key: String::new(),
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    /// Effective base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Sampling parameters for one request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Max output tokens.
    pub max_tokens: Option<u32>,
}

/// Sampling parameters per exchange kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Plain text messages.
    pub text: SamplingParams,
    /// Messages with an image.
    pub image: SamplingParams,
    /// Messages with a document.
    pub document: SamplingParams,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            text: SamplingParams::default(),
            image: SamplingParams {
                temperature: None,
                max_tokens: Some(1000),
            },
            document: SamplingParams {
                temperature: None,
                max_tokens: Some(1500),
            },
        }
    }
}

impl SamplingConfig {
    /// Provider preset.
    #[must_use]
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::default(),
            ProviderKind::DeepSeek => Self {
                text: SamplingParams {
                    temperature: Some(0.7),
                    max_tokens: None,
                },
                ..Self::default()
            },
        }
    }
}

/// Persona, greeting and fixed texts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Page title.
    pub title: String,
    /// Persona / instructions (the seed system turn).
    pub system: String,
    /// Greeting (the seed assistant turn).
    pub greeting: String,
    /// User message recorded when an image is submitted without text.
    pub image_request: String,
    /// User message recorded when a document is submitted without text.
    pub document_request: String,
    /// Assistant reply when the model cannot read images.
    pub vision_fallback: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            title: "Chat".to_string(),
            system: "You are a helpful assistant.".to_string(),
            greeting: "Hello! How can I help you today?".to_string(),
            image_request: "Here is the image I just uploaded. Please analyze and describe it."
                .to_string(),
            document_request:
                "Here is the content of the PDF I just uploaded. Please analyze and summarize it."
                    .to_string(),
            vision_fallback: "Sorry, the current model does not support image analysis. \
                Please use gpt-4-vision-preview or a similar model."
                .to_string(),
        }
    }
}

/// How earlier attachment turns are replayed in later requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentHistory {
    /// Send their message text only.
    #[default]
    TextOnly,
    /// Leave them out entirely.
    Omit,
}

impl FromStr for AttachmentHistory {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text_only" => Ok(Self::TextOnly),
            "omit" => Ok(Self::Omit),
            other => Err(ConfigError::Invalid(format!(
                "unknown history policy: {other}"
            ))),
        }
    }
}

/// Upload handling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Max document characters sent to the model.
    pub document_char_budget: usize,
    /// Characters shown in a document preview.
    pub preview_chars: usize,
    /// Max decoded upload size.
    pub max_upload_bytes: usize,
    /// Max decoded samples of one image embedded in a document.
    pub max_image_bytes: usize,
    /// Where documents are spooled during extraction (system temp dir if unset).
    pub spool_dir: Option<PathBuf>,
    /// Replay policy for earlier attachment turns.
    pub history: AttachmentHistory,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            document_char_budget: 4000,
            preview_chars: 500,
            max_upload_bytes: 20 * 1024 * 1024, // 20 MiB
            max_image_bytes: 64 * 1024 * 1024,
            spool_dir: None,
            history: AttachmentHistory::default(),
        }
    }
}

/// What a model can consume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Accepts image input.
    pub vision: bool,
}

/// Pattern-based capability entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    /// Regex matched against the model id.
    pub pattern: String,
    /// Capabilities granted on match.
    pub capabilities: ModelCapabilities,
}

/// Model capability table: exact ids first, then rules in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Exact model ids.
    pub models: HashMap<String, ModelCapabilities>,
    /// Fallback rules, first match wins.
    pub rules: Vec<CapabilityRule>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        let vision = ModelCapabilities { vision: true };
        let text_only = ModelCapabilities { vision: false };
        let models = [
            ("gpt-4o", vision),
            ("gpt-4o-mini", vision),
            ("gpt-4-turbo", vision),
            ("gpt-4-vision-preview", vision),
            ("gpt-3.5-turbo", text_only),
            ("deepseek-chat", text_only),
            ("deepseek-reasoner", text_only),
        ]
        .into_iter()
        .map(|(id, caps)| (id.to_string(), caps))
        .collect();

        Self {
            models,
            rules: vec![
                CapabilityRule {
                    pattern: "vision".to_string(),
                    capabilities: vision,
                },
                CapabilityRule {
                    pattern: "^gpt-4".to_string(),
                    capabilities: vision,
                },
            ],
        }
    }
}

/// Session lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are destroyed.
    pub idle_ttl_seconds: u64,
    /// Max live sessions.
    pub max_sessions: usize,
    /// Interval between idle sweeps.
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_seconds: 2 * 60 * 60, // 2 hours
            max_sessions: 1000,
            sweep_interval_seconds: 60,
        }
    }
}

/// HTTP surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Static front-end directory.
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            static_dir: PathBuf::from("static"),
        }
    }
}

fn read_required(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::MissingPrompt {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::MissingPrompt {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid(format!("{key}={raw}: {err}"))),
        _ => Ok(None),
    }
}
