use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::*;
use crate::database::lancedb::hybrid::tokenize;
use crate::database::lancedb::{SearchMode, SearchSettings, VectorStore};
use crate::knowledge::LoadOptions;
use crate::model::{ChatCompletion, Embedder, Role, TokenStream, ToolCall};

const DIM: usize = 8;

struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.01; DIM];
                for token in tokenize(text) {
                    vector[token.bytes().map(usize::from).sum::<usize>() % DIM] += 1.0;
                }
                vector
            })
            .collect())
    }
}

/// Chat model that replays a fixed tool decision and token sequence
#[derive(Default)]
struct ScriptedModel {
    tool_calls: Vec<ToolCall>,
    tokens: Vec<std::result::Result<String, String>>,
    fail_complete: bool,
    token_delay: Option<Duration>,
    stall_after_tokens: bool,
    complete_requests: Mutex<Vec<ChatRequest>>,
    stream_requests: Mutex<Vec<ChatRequest>>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedModel {
    fn answering(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| Ok((*t).to_string())).collect(),
            ..Self::default()
        }
    }

    fn searching(mut self, arguments: &str) -> Self {
        self.tool_calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: SEARCH_TOOL_NAME.to_string(),
            arguments: arguments.to_string(),
        }];
        self
    }

    fn complete_calls(&self) -> usize {
        self.complete_requests.lock().expect("lock").len()
    }

    fn last_stream_request(&self) -> ChatRequest {
        self.stream_requests
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("model should have been streamed")
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.complete_requests
            .lock()
            .expect("lock")
            .push(request.clone());
        if self.fail_complete {
            return Err(RagError::Model("rate limited (HTTP 429)".to_string()));
        }
        Ok(ChatCompletion {
            content: None,
            tool_calls: self.tool_calls.clone(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TokenStream> {
        self.stream_requests
            .lock()
            .expect("lock")
            .push(request.clone());

        let (tx, rx) = mpsc::channel(1);
        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        let stopped = Arc::clone(&self.stopped);
        let stall = self.stall_after_tokens;
        tokio::spawn(async move {
            for token in tokens {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let item = token.map_err(RagError::Model);
                if tx.send(item).await.is_err() {
                    stopped.store(true, Ordering::SeqCst);
                    return;
                }
            }
            if stall {
                tx.closed().await;
                stopped.store(true, Ordering::SeqCst);
            }
        });
        Ok(rx)
    }
}

const PAGES: [&str; 4] = [
    "Introduction to place branding and destination image.",
    "The methodology uses a structured survey of tourists.",
    "Importance performance map analysis of the constructs.",
    "Conclusion and directions for future research.",
];

async fn loaded_knowledge(temp_dir: &TempDir) -> Arc<KnowledgeBase> {
    let path = temp_dir.path().join("paper.txt");
    std::fs::write(&path, PAGES.join("\u{c}")).expect("should write document");

    let store = VectorStore::open(
        &temp_dir.path().join("vectors"),
        "papers",
        DIM,
        SearchSettings::default(),
    )
    .await
    .expect("should open store");
    let kb = KnowledgeBase::new(Arc::new(HashEmbedder), Arc::new(store))
        .with_sources(vec![path_source(&path)])
        .with_search_mode(SearchMode::Keyword)
        .with_num_documents(2);
    kb.load(LoadOptions::default()).await.expect("should load");
    Arc::new(kb)
}

fn path_source(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

async fn collect(agent: &Agent, query: &str, history: &[ChatMessage]) -> Vec<RunEvent> {
    let stream = agent.respond(query, history).expect("should start run");
    stream.collect().await
}

#[test]
fn initial_state_follows_settings() {
    let agentic = AgentConfig::default();
    assert_eq!(Agent::initial_state(&agentic, true, "q"), RunState::DecideSearch);
    assert_eq!(Agent::initial_state(&agentic, false, "q"), RunState::Generate);

    let traditional = AgentConfig {
        search_knowledge: false,
        add_context: true,
        ..AgentConfig::default()
    };
    assert_eq!(
        Agent::initial_state(&traditional, true, "q"),
        RunState::Retrieve {
            query: "q".to_string()
        }
    );

    let plain = AgentConfig {
        search_knowledge: false,
        ..AgentConfig::default()
    };
    assert_eq!(Agent::initial_state(&plain, true, "q"), RunState::Generate);
}

#[tokio::test]
async fn agentic_run_retrieves_and_streams() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(
        ScriptedModel::answering(&["A structured ", "survey ", "(page 2)."])
            .searching(r#"{"query": "methodology survey"}"#),
    );
    let settings = AgentConfig {
        show_tool_calls: true,
        ..AgentConfig::default()
    };
    let agent = Agent::new(settings, Arc::clone(&model) as Arc<dyn ChatModel>, Some(knowledge));

    let events = collect(&agent, "What is the methodology?", &[]).await;

    assert_eq!(
        events[0],
        RunEvent::ToolCall {
            name: SEARCH_TOOL_NAME.to_string(),
            query: "methodology survey".to_string(),
        }
    );
    let RunEvent::References(references) = &events[1] else {
        panic!("expected references, got {:?}", events[1]);
    };
    assert!(!references.is_empty());
    assert_eq!(references[0].page_number, 2);
    assert_eq!(
        &events[2..5],
        &[
            RunEvent::Content("A structured ".to_string()),
            RunEvent::Content("survey ".to_string()),
            RunEvent::Content("(page 2).".to_string()),
        ]
    );
    assert_eq!(
        events[5],
        RunEvent::Completed {
            content: "A structured survey (page 2).".to_string()
        }
    );
    assert_eq!(events.len(), 6);

    assert_eq!(model.complete_calls(), 1);
    let request = model.last_stream_request();
    assert!(request.tools.is_empty());
    let user = request.messages.last().expect("should have user message");
    assert_eq!(user.role, Role::User);
    assert!(user.content.contains("<references>"));
    assert!(user.content.contains("page=\"2\""));
    assert!(request.messages[0].content.contains("cite the source and page number"));
}

#[tokio::test]
async fn tool_calls_hidden_by_default() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(ScriptedModel::answering(&["ok"]).searching("{}"));
    let agent = Agent::new(AgentConfig::default(), model, Some(knowledge));

    let events = collect(&agent, "survey", &[]).await;

    assert!(matches!(events[0], RunEvent::References(_)));
    assert!(!events.iter().any(|e| matches!(e, RunEvent::ToolCall { .. })));
}

#[tokio::test]
async fn tool_call_without_query_uses_user_question() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(ScriptedModel::answering(&["ok"]).searching("{}"));
    let settings = AgentConfig {
        show_tool_calls: true,
        ..AgentConfig::default()
    };
    let agent = Agent::new(settings, model, Some(knowledge));

    let events = collect(&agent, "  importance performance  ", &[]).await;

    assert_eq!(
        events[0],
        RunEvent::ToolCall {
            name: SEARCH_TOOL_NAME.to_string(),
            query: "importance performance".to_string(),
        }
    );
}

#[tokio::test]
async fn no_tool_call_answers_without_references() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(ScriptedModel::answering(&["Hello!"]));
    let agent = Agent::new(
        AgentConfig::default(),
        Arc::clone(&model) as Arc<dyn ChatModel>,
        Some(knowledge),
    );

    let events = collect(&agent, "Hi there", &[]).await;

    assert_eq!(
        events,
        vec![
            RunEvent::Content("Hello!".to_string()),
            RunEvent::Completed {
                content: "Hello!".to_string()
            },
        ]
    );
    let request = model.last_stream_request();
    let user = request.messages.last().expect("should have user message");
    assert_eq!(user.content, "Hi there");
}

#[tokio::test]
async fn add_context_retrieves_without_asking_the_model() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(ScriptedModel::answering(&["answer"]));
    let settings = AgentConfig {
        search_knowledge: false,
        add_context: true,
        ..AgentConfig::default()
    };
    let agent = Agent::new(settings, Arc::clone(&model) as Arc<dyn ChatModel>, Some(knowledge));

    let events = collect(&agent, "methodology survey", &[]).await;

    assert_eq!(model.complete_calls(), 0);
    assert!(matches!(&events[0], RunEvent::References(r) if r[0].page_number == 2));
}

#[tokio::test]
async fn agent_without_knowledge_just_generates() {
    let model = Arc::new(ScriptedModel::answering(&["plain"]));
    let agent = Agent::new(
        AgentConfig::default(),
        Arc::clone(&model) as Arc<dyn ChatModel>,
        None,
    );

    let events = collect(&agent, "question", &[]).await;

    assert_eq!(model.complete_calls(), 0);
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn history_window_is_sent_to_model() {
    let model = Arc::new(ScriptedModel::answering(&["third answer"]));
    let settings = AgentConfig {
        num_history_turns: 1,
        ..AgentConfig::default()
    };
    let agent = Agent::new(settings, Arc::clone(&model) as Arc<dyn ChatModel>, None);
    let history = vec![
        ChatMessage::user("first"),
        ChatMessage::assistant("first answer"),
        ChatMessage::user("second"),
        ChatMessage::assistant("second answer"),
    ];

    collect(&agent, "third", &history).await;

    let request = model.last_stream_request();
    let contents: Vec<&str> = request
        .messages
        .iter()
        .skip(1)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["second", "second answer", "third"]);
}

#[tokio::test]
async fn model_error_ends_run_with_failure() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let knowledge = loaded_knowledge(&temp_dir).await;
    let model = Arc::new(ScriptedModel {
        fail_complete: true,
        ..ScriptedModel::default()
    });
    let agent = Agent::new(AgentConfig::default(), model, Some(knowledge));

    let events = collect(&agent, "question", &[]).await;

    assert_eq!(
        events,
        vec![RunEvent::Failed {
            kind: "model",
            message: "rate limited (HTTP 429)".to_string()
        }]
    );
}

#[tokio::test]
async fn stream_error_keeps_partial_output() {
    let model = Arc::new(ScriptedModel {
        tokens: vec![Ok("partial ".to_string()), Err("connection reset".to_string())],
        ..ScriptedModel::default()
    });
    let agent = Agent::new(AgentConfig::default(), model, None);

    let events = collect(&agent, "question", &[]).await;

    assert_eq!(
        events,
        vec![
            RunEvent::Content("partial ".to_string()),
            RunEvent::Failed {
                kind: "model",
                message: "connection reset".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let agent = Agent::new(
        AgentConfig::default(),
        Arc::new(ScriptedModel::default()),
        None,
    );

    assert!(matches!(agent.respond("   ", &[]), Err(RagError::Config(_))));
}

#[tokio::test]
async fn dropping_the_stream_stops_generation() {
    let tokens: Vec<&str> = vec!["token "; 500];
    let model = Arc::new(ScriptedModel {
        token_delay: Some(Duration::from_millis(2)),
        ..ScriptedModel::answering(&tokens)
    });
    let stopped = Arc::clone(&model.stopped);
    let agent = Agent::new(AgentConfig::default(), model, None);

    let mut stream = agent.respond("question", &[]).expect("should start run");
    let first = stream.next().await;
    assert_eq!(first, Some(RunEvent::Content("token ".to_string())));
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("model stream should stop after the consumer goes away");
}

#[tokio::test]
async fn dropping_the_stream_releases_a_stalled_model() {
    let model = Arc::new(ScriptedModel {
        stall_after_tokens: true,
        ..ScriptedModel::answering(&["The study "])
    });
    let stopped = Arc::clone(&model.stopped);
    let agent = Agent::new(AgentConfig::default(), model, None);

    let mut stream = agent.respond("question", &[]).expect("should start run");
    assert_eq!(
        stream.next().await,
        Some(RunEvent::Content("The study ".to_string()))
    );
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("model stream should be released while no token is pending");
}
