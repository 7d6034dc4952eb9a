// Agent module
// Answers questions with optional retrieval from the knowledge base, streaming the answer

#[cfg(test)]
mod tests;

pub mod prompt;

use std::io::Write as _;
use std::sync::Arc;

use console::style;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, Config};
use crate::database::lancedb::SearchResult;
use crate::knowledge::KnowledgeBase;
use crate::model::{ChatMessage, ChatModel, ChatRequest};
use crate::{RagError, Result};

use self::prompt::{SEARCH_TOOL_NAME, build_messages, search_tool, tool_query};

/// Events buffered between a run and its consumer
const RUN_CHANNEL_CAPACITY: usize = 64;

/// A retrieved chunk handed to the model, with what is needed to cite it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub source_uri: String,
    pub document_name: String,
    pub page_number: u32,
    pub char_offset: u64,
    pub content: String,
    pub score: f32,
}

impl From<SearchResult> for Reference {
    #[inline]
    fn from(result: SearchResult) -> Self {
        Self {
            source_uri: result.metadata.source_uri,
            document_name: result.metadata.document_name,
            page_number: result.metadata.page_number,
            char_offset: result.metadata.char_offset,
            content: result.metadata.content,
            score: result.score,
        }
    }
}

/// Observable progress of a single run
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The agent searched the knowledge base; only sent when tool calls are shown
    ToolCall { name: String, query: String },
    References(Vec<Reference>),
    Content(String),
    Completed { content: String },
    Failed { kind: &'static str, message: String },
}

pub type RunStream = ReceiverStream<RunEvent>;

/// Steps of a run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Start,
    DecideSearch,
    Retrieve { query: String },
    Generate,
    Done { content: String },
    Failed { kind: &'static str, message: String },
}

impl RunState {
    #[inline]
    fn failed(error: &RagError) -> Self {
        Self::Failed {
            kind: error.kind(),
            message: error.detail(),
        }
    }
}

/// The consumer went away; the run stops without a final event
struct Cancelled;

#[derive(Clone)]
pub struct Agent {
    settings: Arc<AgentConfig>,
    model: Arc<dyn ChatModel>,
    knowledge: Option<Arc<KnowledgeBase>>,
    temperature: Option<f32>,
}

impl Agent {
    #[inline]
    pub fn new(
        settings: AgentConfig,
        model: Arc<dyn ChatModel>,
        knowledge: Option<Arc<KnowledgeBase>>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            model,
            knowledge,
            temperature: None,
        }
    }

    /// The configured playground agent
    #[inline]
    pub fn from_config(
        config: &Config,
        model: Arc<dyn ChatModel>,
        knowledge: Option<Arc<KnowledgeBase>>,
    ) -> Self {
        Self::new(config.agent.clone(), model, knowledge)
            .with_temperature(config.model.temperature)
    }

    #[inline]
    #[must_use]
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.settings.agent_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[inline]
    pub fn settings(&self) -> &AgentConfig {
        &self.settings
    }

    #[inline]
    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    #[inline]
    pub fn knowledge(&self) -> Option<&Arc<KnowledgeBase>> {
        self.knowledge.as_ref()
    }

    /// Where a run goes first, given the settings and whether a knowledge base is attached
    #[inline]
    pub fn initial_state(settings: &AgentConfig, has_knowledge: bool, query: &str) -> RunState {
        if !has_knowledge {
            return RunState::Generate;
        }
        if settings.search_knowledge {
            RunState::DecideSearch
        } else if settings.add_context {
            RunState::Retrieve {
                query: query.to_string(),
            }
        } else {
            RunState::Generate
        }
    }

    /// Start answering `query` on a background task.
    ///
    /// `history` holds earlier completed turns, oldest first. Dropping the
    /// returned stream stops the run at its next event.
    #[inline]
    pub fn respond(&self, query: &str, history: &[ChatMessage]) -> Result<RunStream> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::Config("message must not be empty".to_string()));
        }

        let (tx, rx) = mpsc::channel(RUN_CHANNEL_CAPACITY);
        let agent = self.clone();
        let query = query.to_string();
        let history = history.to_vec();

        tokio::spawn(async move {
            if agent.run(&query, &history, &tx).await.is_err() {
                debug!("Run for agent {} cancelled by consumer", agent.id());
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn run(
        &self,
        query: &str,
        history: &[ChatMessage],
        tx: &mpsc::Sender<RunEvent>,
    ) -> std::result::Result<(), Cancelled> {
        let mut references: Vec<Reference> = Vec::new();
        let mut state = RunState::Start;

        loop {
            debug!("Agent {} state: {:?}", self.id(), state);
            state = match state {
                RunState::Start => {
                    Self::initial_state(&self.settings, self.knowledge.is_some(), query)
                }
                RunState::DecideSearch => match self.decide_search(query, history).await {
                    Ok(Some(search_query)) => RunState::Retrieve {
                        query: search_query,
                    },
                    Ok(None) => RunState::Generate,
                    Err(e) => RunState::failed(&e),
                },
                RunState::Retrieve { query: search_query } => {
                    if self.settings.show_tool_calls {
                        send(
                            tx,
                            RunEvent::ToolCall {
                                name: SEARCH_TOOL_NAME.to_string(),
                                query: search_query.clone(),
                            },
                        )
                        .await?;
                    }
                    match self.retrieve(&search_query).await {
                        Ok(found) => {
                            references = found;
                            send(tx, RunEvent::References(references.clone())).await?;
                            RunState::Generate
                        }
                        Err(e) => RunState::failed(&e),
                    }
                }
                RunState::Generate => self.generate(query, history, &references, tx).await?,
                RunState::Done { content } => {
                    info!("Agent {} completed a run ({} chars)", self.id(), content.len());
                    return send(tx, RunEvent::Completed { content }).await;
                }
                RunState::Failed { kind, message } => {
                    warn!("Agent {} run failed: {}", self.id(), message);
                    return send(tx, RunEvent::Failed { kind, message }).await;
                }
            };
        }
    }

    /// Ask the model whether to search, returning the search query if so
    async fn decide_search(&self, query: &str, history: &[ChatMessage]) -> Result<Option<String>> {
        let request = ChatRequest::new(build_messages(&self.settings, history, query, &[]))
            .with_tools(vec![search_tool()])
            .with_temperature(self.temperature);

        let completion = self.model.complete(&request).await?;
        let decision = completion
            .tool_calls
            .iter()
            .find(|call| call.name == SEARCH_TOOL_NAME)
            .map(|call| tool_query(call).unwrap_or_else(|| query.to_string()));

        debug!("Search decision for agent {}: {:?}", self.id(), decision);
        Ok(decision)
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<Reference>> {
        let Some(knowledge) = &self.knowledge else {
            return Ok(Vec::new());
        };

        let results = knowledge.search(query, None, None).await?;
        if results.is_empty() {
            warn!(
                "No references found in collection '{}' for query: {}",
                knowledge.collection(),
                query
            );
        }
        Ok(results.into_iter().map(Reference::from).collect())
    }

    async fn generate(
        &self,
        query: &str,
        history: &[ChatMessage],
        references: &[Reference],
        tx: &mpsc::Sender<RunEvent>,
    ) -> std::result::Result<RunState, Cancelled> {
        let request = ChatRequest::new(build_messages(&self.settings, history, query, references))
            .with_temperature(self.temperature);

        let mut tokens = match self.model.stream(&request).await {
            Ok(tokens) => tokens,
            Err(e) => return Ok(RunState::failed(&e)),
        };

        let mut content = String::new();
        loop {
            let token = tokio::select! {
                token = tokens.recv() => token,
                () = tx.closed() => {
                    debug!("Consumer left agent {} mid-answer, closing model stream", self.id());
                    return Err(Cancelled);
                }
            };

            match token {
                Some(Ok(token)) => {
                    content.push_str(&token);
                    send(tx, RunEvent::Content(token)).await?;
                }
                Some(Err(e)) => return Ok(RunState::failed(&e)),
                None => return Ok(RunState::Done { content }),
            }
        }
    }

    /// Stream the answer to stdout, returning the full text
    #[inline]
    pub async fn print_response(&self, query: &str, history: &[ChatMessage]) -> Result<String> {
        let mut stream = self.respond(query, history)?;
        let mut stdout = std::io::stdout();

        while let Some(event) = stream.next().await {
            match event {
                RunEvent::ToolCall { name, query } => {
                    println!("{}", style(format!("Running: {name}(query=\"{query}\")")).dim());
                }
                RunEvent::References(references) => {
                    for reference in &references {
                        println!(
                            "{}",
                            style(format!(
                                "Reference: {} (page {})",
                                reference.document_name, reference.page_number
                            ))
                            .dim()
                        );
                    }
                    println!();
                }
                RunEvent::Content(token) => {
                    print!("{token}");
                    stdout.flush()?;
                }
                RunEvent::Completed { content } => {
                    println!();
                    return Ok(content);
                }
                RunEvent::Failed { kind, message } => {
                    println!();
                    return Err(RagError::from_kind(kind, message));
                }
            }
        }

        Err(RagError::Model(
            "run ended without a final answer".to_string(),
        ))
    }
}

async fn send(tx: &mpsc::Sender<RunEvent>, event: RunEvent) -> std::result::Result<(), Cancelled> {
    tx.send(event).await.map_err(|_| Cancelled)
}
