
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ChatCompletion, ChatMessage, ChatModel, ChatRequest, Embedder, TokenStream, ToolCall};
use crate::config::ModelConfig;
use crate::{RagError, Result};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Client for an OpenAI-compatible endpoint (OpenAI, or a local Ollama `/v1`)
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: Url,
    chat_model: String,
    embedding_model: String,
    dimension: usize,
    batch_size: usize,
    api_key: Option<String>,
    embedding_agent: ureq::Agent,
    chat_agent: ureq::Agent,
    retry_attempts: u32,
    retry_delay: Duration,
}

/// Which API an HTTP call belongs to; decides the error variant
#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Embeddings,
    Chat,
}

impl Endpoint {
    fn error(self, message: String) -> RagError {
        match self {
            Self::Embeddings => RagError::Embedding(message),
            Self::Chat => RagError::Model(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// One parsed line of a server-sent event stream
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Token(String),
    Done,
    Error(String),
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    if data.is_empty() {
        return SseLine::Skip;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(StreamChunk {
            error: Some(error), ..
        }) => SseLine::Error(error.message),
        Ok(chunk) => {
            let token: String = chunk
                .choices
                .into_iter()
                .filter_map(|choice| choice.delta.and_then(|delta| delta.content))
                .collect();
            if token.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Token(token)
            }
        }
        Err(e) => SseLine::Error(format!("malformed stream chunk: {e}")),
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

impl OpenAiClient {
    #[inline]
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let base_url = config.base_url()?;

        Ok(Self {
            base_url,
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimension: config.embedding_dimension as usize,
            batch_size: (config.batch_size as usize).max(1),
            api_key: config.api_key(),
            embedding_agent: build_agent(Duration::from_secs(config.embedding_timeout_secs)),
            chat_agent: build_agent(Duration::from_secs(config.generation_timeout_secs)),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    #[inline]
    pub fn with_timeouts(mut self, embedding: Duration, generation: Duration) -> Self {
        self.embedding_agent = build_agent(embedding);
        self.chat_agent = build_agent(generation);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[inline]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[inline]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[inline]
    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    #[inline]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    /// Check that the endpoint answers the model listing
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        let url = self.endpoint_url("models", Endpoint::Chat)?;
        debug!("Performing health check against {}", url);

        self.make_request_with_retry(Endpoint::Chat, || {
            self.authorize(self.chat_agent.get(url.as_str()))
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        info!("Health check passed for model endpoint {}", self.base_url);
        Ok(())
    }

    /// Generate embeddings for multiple texts, batching by the configured batch size
    #[inline]
    pub fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            results.extend(self.embed_single_batch(batch)?);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }

    fn embed_single_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint_url("embeddings", Endpoint::Embeddings)?;
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
            dimensions: self
                .embedding_model
                .starts_with("text-embedding-3")
                .then_some(self.dimension),
        };
        let request_json = serde_json::to_string(&request).map_err(|e| {
            RagError::Embedding(format!("Failed to serialize embedding request: {e}"))
        })?;

        let response_text = self.make_request_with_retry(Endpoint::Embeddings, || {
            self.authorize(self.embedding_agent.post(url.as_str()))
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let mut response: EmbeddingResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        if response.data.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.data.len()
            )));
        }

        response.data.sort_by_key(|data| data.index);

        let embeddings: Vec<Vec<f32>> = response.data.into_iter().map(|d| d.embedding).collect();
        if let Some(wrong) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(RagError::ConfigMismatch(format!(
                "Model '{}' returned {}-dimensional embeddings but {} are configured",
                self.embedding_model,
                wrong.len(),
                self.dimension
            )));
        }

        Ok(embeddings)
    }

    /// Single non-streamed chat completion
    #[inline]
    pub fn complete_blocking(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let url = self.endpoint_url("chat/completions", Endpoint::Chat)?;
        let request_json = self.chat_request_json(request, false)?;

        let response_text = self.make_request_with_retry(Endpoint::Chat, || {
            self.authorize(self.chat_agent.post(url.as_str()))
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Model(format!("Failed to parse chat response: {e}")))?;

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| RagError::Model("Chat response contained no choices".to_string()))?;

        Ok(ChatCompletion {
            content: message.content.filter(|c| !c.is_empty()),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
        })
    }

    /// Open a streamed completion; retries apply only until the response starts
    fn open_stream(&self, request_json: &str) -> Result<ureq::http::Response<ureq::Body>> {
        let url = self.endpoint_url("chat/completions", Endpoint::Chat)?;
        self.make_request_with_retry(Endpoint::Chat, || {
            self.authorize(self.chat_agent.post(url.as_str()))
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream")
                .send(request_json)
        })
    }

    fn chat_request_json(&self, request: &ChatRequest, stream: bool) -> Result<String> {
        let tools: Vec<WireTool<'_>> = request
            .tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunction {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameters,
                },
            })
            .collect();
        let tool_choice = (!tools.is_empty()).then_some("auto");

        let wire = WireChatRequest {
            model: &self.chat_model,
            messages: &request.messages,
            stream,
            temperature: request.temperature,
            tools,
            tool_choice,
        };
        serde_json::to_string(&wire)
            .map_err(|e| RagError::Model(format!("Failed to serialize chat request: {e}")))
    }

    fn endpoint_url(&self, path: &str, endpoint: Endpoint) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| endpoint.error(format!("Failed to build {path} URL: {e}")))
    }

    fn authorize<B>(&self, request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    fn make_request_with_retry<F, T>(&self, endpoint: Endpoint, mut request_fn: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match request_fn() {
                Ok(response) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response);
                }
                Err(ureq::Error::StatusCode(429)) => {
                    warn!("Rate limited by {}", self.base_url);
                    return Err(endpoint.error("rate limited (HTTP 429)".to_string()));
                }
                Err(ureq::Error::StatusCode(status)) if status >= 500 => {
                    warn!(
                        "Server error (status {}), attempt {}/{}",
                        status, attempt, self.retry_attempts
                    );
                    last_error = Some(format!("server error: HTTP {status}"));
                }
                Err(ureq::Error::StatusCode(status)) => {
                    warn!("Client error (status {}), not retrying", status);
                    return Err(endpoint.error(format!("client error: HTTP {status}")));
                }
                Err(
                    error @ (ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_)),
                ) => {
                    warn!(
                        "Transport error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(format!("transport error: {error}"));
                }
                Err(error) => {
                    warn!("Non-retryable error: {}", error);
                    return Err(endpoint.error(format!("non-retryable error: {error}")));
                }
            }

            if attempt < self.retry_attempts {
                let delay = self.retry_delay * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(endpoint.error(
            last_error.unwrap_or_else(|| "request failed after retries".to_string()),
        ))
    }
}

/// Read an event stream to the end, forwarding tokens until the receiver goes away
fn forward_stream<R: std::io::Read>(reader: R, tx: &mpsc::Sender<Result<String>>) {
    for line in BufReader::new(reader).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                let _ = tx.blocking_send(Err(RagError::Model(format!("stream interrupted: {e}"))));
                return;
            }
        };

        match parse_sse_line(&line) {
            SseLine::Token(token) => {
                if tx.blocking_send(Ok(token)).is_err() {
                    debug!("Token consumer dropped; closing model stream");
                    return;
                }
            }
            SseLine::Done => return,
            SseLine::Error(message) => {
                let _ = tx.blocking_send(Err(RagError::Model(message)));
                return;
            }
            SseLine::Skip => {}
        }
    }

    warn!("Model stream ended without [DONE] marker");
    let _ = tx.blocking_send(Err(RagError::Model(
        "stream ended before [DONE]".to_string(),
    )));
}

#[async_trait]
impl Embedder for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.embedding_model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || client.embed_blocking(&texts))
            .await
            .map_err(|e| RagError::Embedding(format!("Embedding task failed: {e}")))?
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.chat_model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let client = self.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || client.complete_blocking(&request))
            .await
            .map_err(|e| RagError::Model(format!("Completion task failed: {e}")))?
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TokenStream> {
        let request_json = self.chat_request_json(request, true)?;
        let client = self.clone();
        let response = tokio::task::spawn_blocking(move || client.open_stream(&request_json))
            .await
            .map_err(|e| RagError::Model(format!("Stream task failed: {e}")))??;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let reader = response.into_body().into_reader();
            forward_stream(reader, &tx);
        });

        Ok(rx)
    }
}
