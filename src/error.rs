//! Top-level error types for Dashbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Store(StoreError::Query(error))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Conversation store access errors. Retryable from the supervisor's point of
/// view; never fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("concurrent create of {entity} did not converge after {attempts} attempts")]
    Conflict {
        entity: &'static str,
        attempts: usize,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Messaging platform transport errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("failed to connect to {platform}: {reason}")]
    Connect {
        platform: &'static str,
        reason: String,
    },

    #[error("failed to deliver message to chat {chat_id}: {reason}")]
    Send { chat_id: i64, reason: String },

    #[error("failed to fetch file {file_id}: {reason}")]
    File { file_id: String, reason: String },
}

/// Failure classes of the external chat-completion API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("completion API rejected credentials: {0}")]
    AuthFailure(String),

    #[error("completion API rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("could not reach completion API: {0}")]
    ConnectionFailure(String),

    #[error("completion failed: {0}")]
    Other(String),
}

/// Media processing errors (download, transcoding, transcription).
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("unsupported inbound content: {0}")]
    Unsupported(&'static str),

    #[error("media download failed: {0}")]
    Download(String),

    #[error("media of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("transcription returned no speech")]
    NoSpeech,
}
