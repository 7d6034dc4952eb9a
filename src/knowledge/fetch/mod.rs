
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, warn};
use ureq::Agent;

use crate::{RagError, Result};

/// Upper bound on a downloaded source
const MAX_SOURCE_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration for fetching sources
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string to use for requests
    pub user_agent: String,
    /// Timeout for HTTP requests in seconds
    pub timeout_seconds: u64,
    /// Maximum number of retry attempts for retryable errors
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each attempt
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    #[inline]
    fn default() -> Self {
        Self {
            user_agent: concat!("pdf-rag/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_seconds: 60,
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Raw bytes of a source, before extraction
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub uri: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Outcome of a single attempt
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

/// Retrieves sources over HTTP(S) or from the local filesystem
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    agent: Agent,
    config: FetchConfig,
}

impl SourceFetcher {
    /// Create a new fetcher with the given configuration
    #[inline]
    pub fn new(config: FetchConfig) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .user_agent(&config.user_agent)
            .build()
            .into();

        Self { agent, config }
    }

    /// Fetch a source by URI. Strings without a scheme are treated as local paths.
    #[inline]
    pub async fn fetch(&self, uri: &str) -> Result<FetchedSource> {
        if !uri.contains("://") {
            return read_local(uri).await;
        }

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.retry_delay * 2u32.saturating_pow(attempt - 1);
                debug!("Retrying fetch of {} in {:?} (attempt {})", uri, delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }

            let agent = self.agent.clone();
            let url = uri.to_string();
            let outcome = tokio::task::spawn_blocking(move || try_get(&agent, &url))
                .await
                .map_err(|e| RagError::Fetch(format!("Fetch task for {uri} failed: {e}")))?;

            match outcome {
                Ok(source) => {
                    debug!(
                        "Fetched {} bytes from {} (attempt {})",
                        source.bytes.len(),
                        uri,
                        attempt + 1
                    );
                    return Ok(source);
                }
                Err(AttemptError::Retryable(message)) if attempt < self.config.max_retries => {
                    warn!("Retryable error fetching {}: {}", uri, message);
                    last_error = Some(message);
                }
                Err(AttemptError::Retryable(message) | AttemptError::Fatal(message)) => {
                    error!("Failed to fetch {}: {}", uri, message);
                    return Err(RagError::Fetch(format!("{uri}: {message}")));
                }
            }
        }

        Err(RagError::Fetch(format!(
            "{uri}: {}",
            last_error.unwrap_or_else(|| "all retry attempts failed".to_string())
        )))
    }
}

impl Default for SourceFetcher {
    #[inline]
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

/// Attempt a single HTTP GET request without retry logic
fn try_get(agent: &Agent, url: &str) -> std::result::Result<FetchedSource, AttemptError> {
    debug!("Making HTTP GET request to: {}", url);

    match agent.get(url).call() {
        Ok(mut response) => {
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .body_mut()
                .with_config()
                .limit(MAX_SOURCE_BYTES)
                .read_to_vec()
                .map_err(|e| AttemptError::Retryable(format!("failed to read body: {e}")))?;
            Ok(FetchedSource {
                uri: url.to_string(),
                bytes,
                content_type,
            })
        }
        Err(ureq::Error::StatusCode(code)) => {
            let message = format!("HTTP error {code}");
            if code >= 500 {
                Err(AttemptError::Retryable(message))
            } else {
                Err(AttemptError::Fatal(message))
            }
        }
        Err(
            e @ (ureq::Error::Timeout(_)
            | ureq::Error::ConnectionFailed
            | ureq::Error::HostNotFound
            | ureq::Error::Io(_)),
        ) => Err(AttemptError::Retryable(e.to_string())),
        Err(e) => Err(AttemptError::Fatal(e.to_string())),
    }
}

async fn read_local(path: &str) -> Result<FetchedSource> {
    let bytes = tokio::fs::read(Path::new(path))
        .await
        .map_err(|e| RagError::Fetch(format!("{path}: {e}")))?;
    debug!("Read {} bytes from {}", bytes.len(), path);
    Ok(FetchedSource {
        uri: path.to_string(),
        bytes,
        content_type: None,
    })
}
