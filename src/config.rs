//! Configuration loading and validation.

use crate::error::{ConfigError, Result};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var prefix for overrides, e.g. `DASHBOT__SUPERVISOR__POLL_INTERVAL_SECS`.
const ENV_PREFIX: &str = "DASHBOT";

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "dashbot.toml";

/// Dashbot configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sqlx connection string for the conversation store.
    pub database_url: String,

    /// Directory for the rolling log file.
    pub log_dir: PathBuf,

    pub supervisor: SupervisorConfig,
    pub completion: CompletionConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
}

/// Reconciliation loop timing.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay between successful reconciliation passes.
    pub poll_interval_secs: u64,

    /// Delay after a pass that failed to reach the store.
    pub error_backoff_secs: u64,

    /// How long a session may spend draining in-flight handlers on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            error_backoff_secs: 60,
            shutdown_grace_secs: 15,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Chat-completion and transcription provider settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Provider API key. Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,

    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            timeout_secs: 120,
        }
    }
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Media normalization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Model-name fragments that mark a model as able to read images.
    /// Matched case-insensitively as substrings of the assistant's model.
    pub image_capable_models: Vec<String>,

    /// Model name sent to the transcription endpoint.
    pub transcription_model: String,

    /// ffmpeg binary used to transcode voice notes. Empty disables transcoding.
    pub ffmpeg_path: String,

    /// Largest photo or audio payload that will be downloaded.
    pub max_download_bytes: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            image_capable_models: vec![
                "gpt-4-turbo".into(),
                "gpt-4-vision-preview".into(),
                "gpt-4o".into(),
            ],
            transcription_model: "whisper-1".into(),
            ffmpeg_path: "ffmpeg".into(),
            max_download_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Per-session conversation behavior.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of stored turns sent to the completion API as context.
    pub history_limit: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { history_limit: 5 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://dashbot.db?mode=rwc".into(),
            log_dir: Self::default_log_dir(),
            supervisor: SupervisorConfig::default(),
            completion: CompletionConfig::default(),
            media: MediaConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment.
    pub fn load() -> Result<Self> {
        Self::load_layers(Path::new(DEFAULT_CONFIG_FILE), false)
    }

    /// Load from a specific config file path. The file must exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::load_layers(path, true)
    }

    fn load_layers(path: &Path, required: bool) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("media.image_capable_models")
                    .try_parsing(true),
            )
            .build()
            .map_err(|error| ConfigError::Load(error.to_string()))?;

        let mut config: Config = loaded
            .try_deserialize()
            .map_err(|error| ConfigError::Load(error.to_string()))?;

        if config.completion.api_key.is_none() {
            config.completion.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the process cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.completion.api_key.as_deref() {
            None | Some("") => {
                return Err(ConfigError::MissingKey(
                    "completion.api_key (or OPENAI_API_KEY)".into(),
                )
                .into());
            }
            Some(_) => {}
        }

        if self.supervisor.poll_interval_secs == 0 {
            return Err(
                ConfigError::Invalid("supervisor.poll_interval_secs must be > 0".into()).into(),
            );
        }

        if self.session.history_limit <= 0 {
            return Err(ConfigError::Invalid("session.history_limit must be > 0".into()).into());
        }

        Ok(())
    }

    /// The API key, once [`Config::validate`] has passed.
    pub fn api_key(&self) -> &str {
        self.completion.api_key.as_deref().unwrap_or_default()
    }

    fn default_log_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("dashbot").join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}
