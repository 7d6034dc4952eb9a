use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch source: {0}")]
    Fetch(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Stable machine-readable name of the error class
    #[inline]
    pub fn kind(&self) -> &'static str {
        match *self {
            Self::Config(_) => "config",
            Self::Fetch(_) => "fetch",
            Self::Embedding(_) => "embedding",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Model(_) => "model",
            Self::ConfigMismatch(_) => "config_mismatch",
            Self::Database(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }

    /// The error message without its class prefix
    #[inline]
    pub fn detail(&self) -> String {
        match self {
            Self::Config(message)
            | Self::Fetch(message)
            | Self::Embedding(message)
            | Self::StoreUnavailable(message)
            | Self::Model(message)
            | Self::ConfigMismatch(message)
            | Self::Database(message)
            | Self::NotFound(message) => message.clone(),
            Self::Io(error) => error.to_string(),
            Self::Other(error) => format!("{error:#}"),
        }
    }

    /// Rebuild an error from its [`kind`](Self::kind) and message, e.g. after
    /// it crossed a channel as plain data
    #[inline]
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "config" => Self::Config(message),
            "fetch" => Self::Fetch(message),
            "embedding" => Self::Embedding(message),
            "store_unavailable" => Self::StoreUnavailable(message),
            "model" => Self::Model(message),
            "config_mismatch" => Self::ConfigMismatch(message),
            "database" => Self::Database(message),
            "not_found" => Self::NotFound(message),
            "io" => Self::Io(std::io::Error::other(message)),
            _ => Self::Other(anyhow::anyhow!(message)),
        }
    }
}

impl From<config::ConfigError> for RagError {
    #[inline]
    fn from(error: config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

pub mod agent;
pub mod commands;
pub mod config;
pub mod database;
pub mod knowledge;
pub mod model;
pub mod playground;
