
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::database::lancedb::SearchMode;
use crate::knowledge::chunking::ChunkingConfig;

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1536;
pub const DEFAULT_SOURCE_URL: &str =
    "https://raw.githubusercontent.com/arad1367/UniLi_sources/main/WS_PejmanEbrahimi.pdf";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub playground: PlaygroundConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Connection settings for the OpenAI-compatible model endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Path prefix of the API, e.g. `/v1`
    pub base_path: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimension: u32,
    pub batch_size: u32,
    pub temperature: Option<f32>,
    pub embedding_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            protocol: "https".to_string(),
            host: "api.openai.com".to_string(),
            port: 443,
            base_path: "/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            batch_size: 64,
            temperature: None,
            embedding_timeout_secs: 30,
            generation_timeout_secs: 300,
            retry_attempts: 3,
        }
    }
}

/// Knowledge base: which documents are indexed and how they are searched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Collection (table) shared by the loader and the agents
    pub collection: String,
    /// PDF URLs or local paths
    pub sources: Vec<String>,
    pub search_mode: SearchMode,
    /// Number of chunks handed to the agent per retrieval
    pub num_documents: usize,
    pub dense_weight: f32,
    pub keyword_weight: f32,
    /// Hybrid candidates fetched per method, as a multiple of `k`
    pub candidate_multiplier: usize,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            collection: "Place Branding in Tourist".to_string(),
            sources: vec![DEFAULT_SOURCE_URL.to_string()],
            search_mode: SearchMode::Hybrid,
            num_documents: 5,
            dense_weight: 0.7,
            keyword_weight: 0.3,
            candidate_multiplier: 4,
            search_timeout_secs: 10,
            fetch_timeout_secs: 60,
            fetch_retries: 2,
        }
    }
}

/// Settings of the agent served by the playground
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub name: String,
    pub description: Option<String>,
    pub instructions: Vec<String>,
    /// Let the model decide whether to search the knowledge base
    pub search_knowledge: bool,
    /// Always attach retrieved references when not searching agentically
    pub add_context: bool,
    pub show_tool_calls: bool,
    pub read_chat_history: bool,
    pub num_history_turns: usize,
    pub markdown: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "rag-agent".to_string(),
            name: "RAG Agent".to_string(),
            description: None,
            instructions: vec![
                "Always search your knowledge base first and use it if available.".to_string(),
                "Share the page number or source URL of the information you used in your response."
                    .to_string(),
                "If method benefits are mentioned, include them in the response.".to_string(),
                "Important: Use tables where possible.".to_string(),
            ],
            search_knowledge: true,
            add_context: false,
            show_tool_calls: false,
            read_chat_history: true,
            num_history_turns: 3,
            markdown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlaygroundConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 2048)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 8192)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid timeout for {0}: must be between 1 and 3600 seconds")]
    InvalidTimeout(&'static str),
    #[error("Invalid collection name: '{0}' (must contain at least one letter or digit)")]
    InvalidCollection(String),
    #[error("Invalid source: {0}")]
    InvalidSource(String),
    #[error("Invalid number of documents: {0} (must be between 1 and 100)")]
    InvalidNumDocuments(usize),
    #[error("Invalid search weights: dense {0}, keyword {1} (must be >= 0 and not both 0)")]
    InvalidSearchWeights(f32, f32),
    #[error("Invalid candidate multiplier: {0} (must be between 1 and 20)")]
    InvalidCandidateMultiplier(usize),
    #[error("Invalid agent id: '{0}' (cannot be empty or contain '/')")]
    InvalidAgentId(String),
    #[error("Invalid target chunk size: {0} (must be between 16 and 2048)")]
    InvalidTargetChunkSize(usize),
    #[error("Invalid max chunk size: {0} (must be between 32 and 4096)")]
    InvalidMaxChunkSize(usize),
    #[error("Invalid min chunk size: {0} (must be between 1 and 1024)")]
    InvalidMinChunkSize(usize),
    #[error("Invalid overlap size: {0} (must be between 0 and 512)")]
    InvalidOverlapSize(usize),
    #[error("Max chunk size ({0}) must be greater than target chunk size ({1})")]
    MaxChunkSizeTooSmall(usize, usize),
    #[error("Target chunk size ({0}) must be greater than min chunk size ({1})")]
    TargetChunkSizeTooSmall(usize, usize),
    #[error("Overlap size ({0}) must be smaller than target chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            knowledge: KnowledgeConfig::default(),
            chunking: ChunkingConfig::default(),
            agent: AgentConfig::default(),
            playground: PlaygroundConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Default configuration directory for this user
    #[inline]
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("pdf-rag"))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Defaults rooted at `base_dir`
    #[inline]
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self::with_base_dir(config_dir));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.knowledge.validate()?;
        self.agent.validate()?;
        self.validate_chunking_config()?;
        if self.playground.port == 0 {
            return Err(ConfigError::InvalidPort(self.playground.port));
        }
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(16..=2048).contains(&config.target_chunk_size) {
            return Err(ConfigError::InvalidTargetChunkSize(
                config.target_chunk_size,
            ));
        }

        if !(32..=4096).contains(&config.max_chunk_size) {
            return Err(ConfigError::InvalidMaxChunkSize(config.max_chunk_size));
        }

        if !(1..=1024).contains(&config.min_chunk_size) {
            return Err(ConfigError::InvalidMinChunkSize(config.min_chunk_size));
        }

        if config.overlap_size > 512 {
            return Err(ConfigError::InvalidOverlapSize(config.overlap_size));
        }

        if config.max_chunk_size <= config.target_chunk_size {
            return Err(ConfigError::MaxChunkSizeTooSmall(
                config.max_chunk_size,
                config.target_chunk_size,
            ));
        }

        if config.target_chunk_size <= config.min_chunk_size {
            return Err(ConfigError::TargetChunkSizeTooSmall(
                config.target_chunk_size,
                config.min_chunk_size,
            ));
        }

        if config.overlap_size >= config.target_chunk_size {
            return Err(ConfigError::OverlapTooLarge(
                config.overlap_size,
                config.target_chunk_size,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Path of the SQLite database holding agent sessions
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("sessions.db")
    }

    /// Path of the LanceDB directory holding chunk embeddings
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.base_url()?;

        if self.chat_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.chat_model.clone()));
        }

        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.embedding_model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 2048 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(8..=8192).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=3600).contains(&self.embedding_timeout_secs) {
            return Err(ConfigError::InvalidTimeout("embedding"));
        }

        if !(1..=3600).contains(&self.generation_timeout_secs) {
            return Err(ConfigError::InvalidTimeout("generation"));
        }

        Ok(())
    }

    /// Base URL of the API with a trailing slash, ready for `Url::join`
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let path = self.base_path.trim_matches('/');
        let url_str = if path.is_empty() {
            format!("{}://{}:{}/", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}/{}/", self.protocol, self.host, self.port, path)
        };
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    /// API key from the configured environment variable, if set
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = ModelConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.base_url()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_chat_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.chat_model = model;
        Ok(())
    }

    pub fn set_embedding_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.embedding_model = model;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 2048 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn set_embedding_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(8..=8192).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.embedding_dimension = dimension;
        Ok(())
    }
}

impl KnowledgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.collection.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidCollection(self.collection.clone()));
        }

        for source in &self.sources {
            if source.trim().is_empty() {
                return Err(ConfigError::InvalidSource("empty source".to_string()));
            }
            if source.contains("://") {
                let url =
                    Url::parse(source).map_err(|_| ConfigError::InvalidSource(source.clone()))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::InvalidSource(source.clone()));
                }
            }
        }

        if !(1..=100).contains(&self.num_documents) {
            return Err(ConfigError::InvalidNumDocuments(self.num_documents));
        }

        if self.dense_weight < 0.0
            || self.keyword_weight < 0.0
            || self.dense_weight + self.keyword_weight <= 0.0
        {
            return Err(ConfigError::InvalidSearchWeights(
                self.dense_weight,
                self.keyword_weight,
            ));
        }

        if !(1..=20).contains(&self.candidate_multiplier) {
            return Err(ConfigError::InvalidCandidateMultiplier(
                self.candidate_multiplier,
            ));
        }

        if !(1..=3600).contains(&self.search_timeout_secs) {
            return Err(ConfigError::InvalidTimeout("search"));
        }

        if !(1..=3600).contains(&self.fetch_timeout_secs) {
            return Err(ConfigError::InvalidTimeout("fetch"));
        }

        Ok(())
    }

    pub fn set_collection(&mut self, collection: String) -> Result<(), ConfigError> {
        if !collection.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidCollection(collection));
        }
        self.collection = collection;
        Ok(())
    }

    pub fn set_num_documents(&mut self, num_documents: usize) -> Result<(), ConfigError> {
        if !(1..=100).contains(&num_documents) {
            return Err(ConfigError::InvalidNumDocuments(num_documents));
        }
        self.num_documents = num_documents;
        Ok(())
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() || self.agent_id.contains('/') {
            return Err(ConfigError::InvalidAgentId(self.agent_id.clone()));
        }
        Ok(())
    }
}
