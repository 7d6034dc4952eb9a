// Playground module
// Serves agents and their persisted sessions; every run is recorded turn by turn


pub mod routes;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Reference, RunEvent, RunStream};
use crate::database::lancedb::CollectionInfo;
use crate::database::sqlite::Database;
use crate::database::sqlite::models::{NewTurn, Session, SessionTurn, Transcript, TurnStatus};
use crate::{RagError, Result};

/// Events buffered between a session run and its client
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How often partial assistant output is written while streaming
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// What a client sees while a message is answered
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaygroundEvent {
    RunStarted {
        session_id: String,
        agent_id: String,
    },
    ToolCall {
        name: String,
        query: String,
    },
    References {
        references: Vec<Reference>,
    },
    Content {
        content: String,
    },
    Completed {
        session_id: String,
        content: String,
    },
    Failed {
        session_id: String,
        kind: String,
        message: String,
    },
}

pub type PlaygroundStream = ReceiverStream<PlaygroundEvent>;

/// Public description of a served agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    pub description: Option<String>,
    pub search_knowledge: bool,
    pub read_chat_history: bool,
    pub knowledge_collection: Option<String>,
}

impl From<&Agent> for AgentSummary {
    #[inline]
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id().to_string(),
            name: agent.name().to_string(),
            model: agent.model_id().to_string(),
            description: agent.settings().description.clone(),
            search_knowledge: agent.settings().search_knowledge,
            read_chat_history: agent.settings().read_chat_history,
            knowledge_collection: agent.knowledge().map(|kb| kb.collection().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaygroundStatus {
    pub playground: &'static str,
    pub agents: usize,
    pub collections: Vec<CollectionInfo>,
}

/// Result of a run collected in full
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub content: String,
    pub references: Vec<Reference>,
}

pub struct Playground {
    agents: BTreeMap<String, Agent>,
    database: Database,
    flush_interval: Duration,
}

impl Playground {
    #[inline]
    pub fn new(agents: Vec<Agent>, database: Database) -> Self {
        let agents = agents
            .into_iter()
            .map(|agent| (agent.id().to_string(), agent))
            .collect();

        Self {
            agents,
            database,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn agents(&self) -> Vec<AgentSummary> {
        self.agents.values().map(AgentSummary::from).collect()
    }

    #[inline]
    pub fn agent(&self, agent_id: &str) -> Result<&Agent> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| RagError::NotFound(format!("agent {agent_id}")))
    }

    #[inline]
    pub async fn status(&self) -> Result<PlaygroundStatus> {
        let mut collections: Vec<CollectionInfo> = Vec::new();
        for agent in self.agents.values() {
            if let Some(knowledge) = agent.knowledge() {
                if collections.iter().any(|c| c.collection == knowledge.collection()) {
                    continue;
                }
                collections.push(knowledge.status().await?);
            }
        }

        Ok(PlaygroundStatus {
            playground: "available",
            agents: self.agents.len(),
            collections,
        })
    }

    #[inline]
    pub async fn open_session(&self, agent_id: &str, name: Option<&str>) -> Result<Session> {
        self.agent(agent_id)?;
        let session = self.database.create_session(agent_id, name).await?;
        info!("Opened session {} for agent {}", session.session_id, agent_id);
        Ok(session)
    }

    #[inline]
    pub async fn list_sessions(&self, agent_id: &str) -> Result<Vec<Session>> {
        self.agent(agent_id)?;
        self.database.list_sessions(Some(agent_id)).await
    }

    /// Session belonging to `agent_id`; a session of another agent is not found
    #[inline]
    pub async fn session(&self, agent_id: &str, session_id: &str) -> Result<Session> {
        self.agent(agent_id)?;
        let session = self.database.require_session(session_id).await?;
        if session.agent_id != agent_id {
            return Err(RagError::NotFound(format!(
                "session {session_id} for agent {agent_id}"
            )));
        }
        Ok(session)
    }

    #[inline]
    pub async fn transcript(&self, agent_id: &str, session_id: &str) -> Result<Transcript> {
        self.session(agent_id, session_id).await?;
        self.database.transcript(session_id).await
    }

    #[inline]
    pub async fn rename_session(
        &self,
        agent_id: &str,
        session_id: &str,
        name: &str,
    ) -> Result<Session> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RagError::Config("session name must not be empty".to_string()));
        }
        self.session(agent_id, session_id).await?;
        self.database.rename_session(session_id, name).await?;
        self.database.require_session(session_id).await
    }

    #[inline]
    pub async fn delete_session(&self, agent_id: &str, session_id: &str) -> Result<()> {
        self.session(agent_id, session_id).await?;
        self.database.delete_session(session_id).await?;
        Ok(())
    }

    /// Answer `text` in an existing session.
    ///
    /// The user turn is stored before the agent starts. The assistant turn is
    /// stored as `streaming`, refreshed with partial output while tokens
    /// arrive, and closed as `complete`, `failed` or `cancelled`.
    #[inline]
    pub async fn post_message(&self, session_id: &str, text: &str) -> Result<PlaygroundStream> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RagError::Config("message must not be empty".to_string()));
        }

        let transcript = self.database.transcript(session_id).await?;
        let agent = self.agent(&transcript.session.agent_id)?;

        let history = if agent.settings().read_chat_history {
            transcript.history()
        } else {
            Vec::new()
        };

        self.database
            .append_turn(&NewTurn::user(session_id, text))
            .await?;
        let run = agent.respond(text, &history)?;
        let turn = self
            .database
            .append_turn(&NewTurn::streaming_assistant(session_id))
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let recorder = TurnRecorder {
            database: self.database.clone(),
            turn,
            agent_id: agent.id().to_string(),
            flush_interval: self.flush_interval,
        };
        tokio::spawn(recorder.record(run, tx));

        Ok(ReceiverStream::new(rx))
    }

    /// Answer in the given session, or in a new one when none is given
    #[inline]
    pub async fn run(
        &self,
        agent_id: &str,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<(Session, PlaygroundStream)> {
        if text.trim().is_empty() {
            return Err(RagError::Config("message must not be empty".to_string()));
        }

        let session = match session_id {
            Some(session_id) => self.session(agent_id, session_id).await?,
            None => self.open_session(agent_id, None).await?,
        };
        let stream = self.post_message(&session.session_id, text).await?;
        Ok((session, stream))
    }
}

/// Drain a run to completion, returning the answer or the error it ended with
#[inline]
pub async fn collect_run(mut stream: PlaygroundStream) -> Result<RunOutcome> {
    let mut references = Vec::new();

    while let Some(event) = stream.next().await {
        match event {
            PlaygroundEvent::References { references: found } => references = found,
            PlaygroundEvent::Completed {
                session_id,
                content,
            } => {
                return Ok(RunOutcome {
                    session_id,
                    content,
                    references,
                });
            }
            PlaygroundEvent::Failed { kind, message, .. } => {
                return Err(RagError::from_kind(&kind, message));
            }
            PlaygroundEvent::RunStarted { .. }
            | PlaygroundEvent::ToolCall { .. }
            | PlaygroundEvent::Content { .. } => {}
        }
    }

    Err(RagError::Model("run ended without a final answer".to_string()))
}

/// Forwards one run to its client while persisting the assistant turn
struct TurnRecorder {
    database: Database,
    turn: SessionTurn,
    agent_id: String,
    flush_interval: Duration,
}

impl TurnRecorder {
    async fn record(self, mut run: RunStream, tx: mpsc::Sender<PlaygroundEvent>) {
        let session_id = self.turn.session_id.clone();
        let mut content = String::new();
        let mut last_flush = Instant::now();

        let started = PlaygroundEvent::RunStarted {
            session_id: session_id.clone(),
            agent_id: self.agent_id.clone(),
        };
        if tx.send(started).await.is_err() {
            self.finish(&content, TurnStatus::Cancelled).await;
            return;
        }

        loop {
            let event = tokio::select! {
                event = run.next() => event,
                () = tx.closed() => {
                    debug!("Client left session {}, cancelling run", session_id);
                    self.finish(&content, TurnStatus::Cancelled).await;
                    return;
                }
            };

            let (forward, status) = match event {
                Some(RunEvent::ToolCall { name, query }) => {
                    (PlaygroundEvent::ToolCall { name, query }, None)
                }
                Some(RunEvent::References(references)) => {
                    (PlaygroundEvent::References { references }, None)
                }
                Some(RunEvent::Content(token)) => {
                    content.push_str(&token);
                    (PlaygroundEvent::Content { content: token }, None)
                }
                Some(RunEvent::Completed { content: answer }) => {
                    content = answer;
                    (
                        PlaygroundEvent::Completed {
                            session_id: session_id.clone(),
                            content: content.clone(),
                        },
                        Some(TurnStatus::Complete),
                    )
                }
                Some(RunEvent::Failed { kind, message }) => (
                    PlaygroundEvent::Failed {
                        session_id: session_id.clone(),
                        kind: kind.to_string(),
                        message,
                    },
                    Some(TurnStatus::Failed),
                ),
                None => {
                    warn!("Run in session {} ended without a final event", session_id);
                    self.finish(&content, TurnStatus::Failed).await;
                    return;
                }
            };

            if let Some(status) = status {
                self.finish(&content, status).await;
                let _ = tx.send(forward).await;
                return;
            }

            if tx.send(forward).await.is_err() {
                self.finish(&content, TurnStatus::Cancelled).await;
                return;
            }

            if last_flush.elapsed() >= self.flush_interval {
                self.flush(&content).await;
                last_flush = Instant::now();
            }
        }
    }

    async fn flush(&self, content: &str) {
        if let Err(e) = self
            .database
            .update_turn(self.turn.id, content, TurnStatus::Streaming)
            .await
        {
            warn!("Failed to save partial answer for turn {}: {}", self.turn.id, e);
        }
    }

    async fn finish(&self, content: &str, status: TurnStatus) {
        match self.database.update_turn(self.turn.id, content, status).await {
            Ok(_) => debug!("Turn {} finished as {}", self.turn.id, status),
            Err(e) => warn!("Failed to finish turn {}: {}", self.turn.id, e),
        }
    }
}
