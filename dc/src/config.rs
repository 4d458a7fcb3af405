//! DeskConnector configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::ModelEntry;
use crate::llm::LlmError;

/// Environment variable naming the server to connect to
pub const SERVER_URL_ENV: &str = "CONNECTOR_SERVER_URL";

/// Project-local config file name, looked up in the base directory
pub const LOCAL_CONFIG_FILE: &str = ".deskconnector.yml";

/// Main DeskConnector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level for the file logger (overridden by --log-level)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Connection to the desktop server
    pub server: ServerConfig,

    /// Session behaviour: reflections, pacing, confirmations
    pub session: SessionConfig,

    /// Primary engine configuration
    pub engine: EngineConfig,

    /// LLM provider endpoints and credentials
    pub llm: LlmConfig,

    /// Extra model catalog entries, merged over the built-in catalog
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
}

/// Minimal view used to read the log level before logging is initialised
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogLevelOnly {
    #[serde(rename = "log-level")]
    log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.session.chunk_yield_ms == 0 {
            return Err(eyre::eyre!("session.chunk-yield-ms must be greater than zero"));
        }
        if self.session.confirmation_poll_ms == 0 {
            return Err(eyre::eyre!("session.confirmation-poll-ms must be greater than zero"));
        }
        if self.session.confirmation_timeout_ms == Some(0) {
            return Err(eyre::eyre!("session.confirmation-timeout-ms must be greater than zero when set"));
        }
        if self.engine.max_tokens == 0 {
            return Err(eyre::eyre!("engine.max-tokens must be greater than zero"));
        }
        if self.engine.main_model.trim().is_empty() {
            return Err(eyre::eyre!("engine.main-model must not be empty"));
        }
        for entry in &self.models {
            if self.llm.provider(&entry.provider).is_none() {
                return Err(eyre::eyre!(
                    "Model '{}' uses unknown provider '{}'. Supported: anthropic, openai",
                    entry.name,
                    entry.provider
                ));
            }
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `.deskconnector.yml` in `base_dir`, then the user
    /// config, then defaults.
    pub fn load(config_path: Option<&PathBuf>, base_dir: &Path) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = base_dir.join(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(user_config) = Self::user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, tolerating any failure
    ///
    /// Runs before logging is set up, so errors are swallowed.
    pub fn load_log_level(config_path: Option<&PathBuf>, base_dir: &Path) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(base_dir.join(LOCAL_CONFIG_FILE))
                .chain(Self::user_config_path())
                .collect(),
        };

        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(path).ok()?;
                serde_yaml::from_str::<LogLevelOnly>(&content).ok()
            })
            .and_then(|c| c.log_level)
    }

    /// `~/.config/deskconnector/deskconnector.yml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("deskconnector").join("deskconnector.yml"))
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Server connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server URL (`http://host:port`, `tcp://host:port` or `unix:/path`)
    pub url: String,

    /// Connection attempts before giving up
    #[serde(rename = "connect-retries")]
    pub connect_retries: u32,

    /// Initial delay between attempts, doubled each retry
    #[serde(rename = "retry-backoff-ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:24337".to_string(),
            connect_retries: 5,
            retry_backoff_ms: 500,
        }
    }
}

impl ServerConfig {
    /// Effective URL: CLI flag, then environment, then config
    pub fn resolve_url(&self, cli_url: Option<&str>) -> String {
        if let Some(url) = cli_url {
            return url.to_string();
        }
        match std::env::var(SERVER_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => url,
            _ => self.url.clone(),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum follow-up runs a single prompt may trigger
    #[serde(rename = "max-reflections")]
    pub max_reflections: u32,

    /// Pause after each streamed chunk
    #[serde(rename = "chunk-yield-ms")]
    pub chunk_yield_ms: u64,

    /// Upper bound between checks of a pending confirmation
    #[serde(rename = "confirmation-poll-ms")]
    pub confirmation_poll_ms: u64,

    /// Give up on an unanswered confirmation (declining it); absent waits forever
    #[serde(rename = "confirmation-timeout-ms", skip_serializing_if = "Option::is_none")]
    pub confirmation_timeout_ms: Option<u64>,

    /// Pause after ordinary outbound sends
    #[serde(rename = "action-delay-ms")]
    pub action_delay_ms: u64,

    /// Write every outbound event to a JSONL transcript
    pub transcript: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reflections: 3,
            chunk_yield_ms: 10,
            confirmation_poll_ms: 1000,
            confirmation_timeout_ms: None,
            action_delay_ms: 10,
            transcript: false,
        }
    }
}

impl SessionConfig {
    pub fn chunk_yield(&self) -> Duration {
        Duration::from_millis(self.chunk_yield_ms)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    pub fn confirmation_timeout(&self) -> Option<Duration> {
        self.confirmation_timeout_ms.map(Duration::from_millis)
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }
}

/// Primary engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default edit mode of the session
    #[serde(rename = "edit-format")]
    pub edit_format: String,

    #[serde(rename = "main-model")]
    pub main_model: String,

    #[serde(rename = "weak-model", skip_serializing_if = "Option::is_none")]
    pub weak_model: Option<String>,

    #[serde(rename = "editor-model", skip_serializing_if = "Option::is_none")]
    pub editor_model: Option<String>,

    #[serde(rename = "editor-edit-format", skip_serializing_if = "Option::is_none")]
    pub editor_edit_format: Option<String>,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            edit_format: "code".to_string(),
            main_model: "claude-sonnet-4-5".to_string(),
            weak_model: None,
            editor_model: None,
            editor_edit_format: None,
            max_tokens: 8192,
            timeout_ms: 300_000,
        }
    }
}

/// LLM provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig {
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                base_url: "https://api.anthropic.com".to_string(),
            },
            openai: ProviderConfig {
                api_key_env: "OPENAI_API_KEY".to_string(),
                base_url: "https://api.openai.com".to_string(),
            },
        }
    }
}

impl LlmConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            _ => None,
        }
    }
}

/// One provider's endpoint and credential source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,
}

impl ProviderConfig {
    /// Read the API key from the environment
    pub fn api_key(&self) -> Result<String, LlmError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(LlmError::MissingApiKey(self.api_key_env.clone())),
        }
    }
}
