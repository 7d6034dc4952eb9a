use anyhow::{Context, Result};
use console::style;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::Config;
use crate::database::lancedb::{SearchMode, VectorStore};
use crate::database::sqlite::Database;
use crate::database::sqlite::models::{TurnRole, TurnStatus};
use crate::knowledge::{KnowledgeBase, LoadOptions, LoadReport};
use crate::model::{ChatModel, Embedder, OpenAiClient};
use crate::playground::{Playground, PlaygroundEvent, routes};
use crate::RagError;

/// Collaborators shared by every command that talks to the model or the store
struct Runtime {
    config: Config,
    client: Arc<OpenAiClient>,
    knowledge: Arc<KnowledgeBase>,
}

fn load_config(config_dir: &Path) -> Result<Config> {
    Config::load(config_dir).context("Failed to load configuration")
}

impl Runtime {
    async fn open(config: Config) -> Result<Self> {
        let client = Arc::new(
            OpenAiClient::new(&config.model).context("Failed to create model client")?,
        );
        let store = Arc::new(
            VectorStore::from_config(&config)
                .await
                .context("Failed to open vector store")?,
        );
        let embedder = Arc::clone(&client) as Arc<dyn Embedder>;
        let knowledge =
            Arc::new(KnowledgeBase::from_config(&config, embedder, store).with_progress(true));

        Ok(Self {
            config,
            client,
            knowledge,
        })
    }

    fn agent(&self) -> Agent {
        let model = Arc::clone(&self.client) as Arc<dyn ChatModel>;
        Agent::from_config(&self.config, model, Some(Arc::clone(&self.knowledge)))
    }
}

fn print_load_report(report: &LoadReport) {
    println!("{}", style("✓ Knowledge base loaded").green());
    println!("  Documents: {}", report.documents);
    println!("  Pages: {}", report.pages);
    println!("  Chunks: {}", report.chunks);
    println!("  Newly indexed: {}", report.chunks_indexed);
    for source in &report.empty_sources {
        println!(
            "  {} {}",
            style("⚠ No extractable text in").yellow(),
            style(source).cyan()
        );
    }
}

/// Fetch, chunk, embed and store the configured sources (or the given ones)
#[inline]
pub async fn load_sources(
    config_dir: &Path,
    sources: Vec<String>,
    options: LoadOptions,
) -> Result<LoadReport> {
    let mut config = load_config(config_dir)?;
    if !sources.is_empty() {
        config.knowledge.sources = sources;
    }
    let runtime = Runtime::open(config).await?;
    let knowledge = &runtime.knowledge;

    info!(
        "Loading {} source(s) into collection '{}'",
        knowledge.sources().len(),
        knowledge.collection()
    );
    let report = knowledge
        .load(options)
        .await
        .context("Failed to load knowledge base")?;
    print_load_report(&report);
    Ok(report)
}

/// Print the chunks ranked for `query`
#[inline]
pub async fn search_knowledge(
    config_dir: &Path,
    query: &str,
    mode: Option<SearchMode>,
    k: Option<usize>,
) -> Result<()> {
    let runtime = Runtime::open(load_config(config_dir)?).await?;
    let results = runtime
        .knowledge
        .search(query, mode, k)
        .await
        .context("Search failed")?;

    if results.is_empty() {
        println!("No matching chunks. Has the knowledge base been loaded?");
        return Ok(());
    }

    for (rank, result) in results.iter().enumerate() {
        println!(
            "{} {} (page {}) score {:.3}",
            style(format!("{}.", rank + 1)).bold(),
            style(&result.metadata.document_name).cyan(),
            result.metadata.page_number,
            result.score
        );
        let preview: String = result.metadata.content.chars().take(240).collect();
        println!("   {}", preview.replace('\n', " "));
        println!();
    }
    Ok(())
}

/// Answer a question on the console, optionally inside a stored session
#[inline]
pub async fn ask(
    config_dir: &Path,
    query: &str,
    agentic: bool,
    add_context: bool,
    session_id: Option<&str>,
) -> Result<()> {
    let mut config = load_config(config_dir)?;
    if agentic {
        config.agent.search_knowledge = true;
    }
    if add_context {
        config.agent.add_context = true;
    }
    let runtime = Runtime::open(config).await?;
    let agent = runtime.agent();

    let Some(session_id) = session_id else {
        agent.print_response(query, &[]).await?;
        return Ok(());
    };

    let database = Database::initialize_from_config_dir(&runtime.config.base_dir).await?;
    let playground = Playground::new(vec![agent], database);
    let mut stream = playground.post_message(session_id, query).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = stream.next().await {
        match event {
            PlaygroundEvent::ToolCall { name, query } => {
                println!("{}", style(format!("Running: {name}(query=\"{query}\")")).dim());
            }
            PlaygroundEvent::Content { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            PlaygroundEvent::Completed { .. } => {
                println!();
                break;
            }
            PlaygroundEvent::Failed { kind, message, .. } => {
                println!();
                return Err(RagError::from_kind(&kind, message).into());
            }
            PlaygroundEvent::RunStarted { .. } | PlaygroundEvent::References { .. } => {}
        }
    }
    Ok(())
}

/// List stored sessions, newest first
#[inline]
pub async fn list_sessions(config_dir: &Path, agent_id: Option<&str>) -> Result<()> {
    let database = Database::initialize_from_config_dir(config_dir).await?;
    let sessions = database.list_sessions(agent_id).await?;

    if sessions.is_empty() {
        println!("No sessions stored.");
        return Ok(());
    }

    println!("Sessions:");
    println!("{}", "=".repeat(80));
    for session in sessions {
        let turns = database.transcript(&session.session_id).await?.turns.len();
        println!(
            "{} {} [{}] {} turn(s), updated {}",
            style(&session.session_id).cyan(),
            session.session_name.as_deref().unwrap_or("(unnamed)"),
            session.agent_id,
            turns,
            session.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Print a session transcript in position order
#[inline]
pub async fn show_session(config_dir: &Path, session_id: &str) -> Result<()> {
    let database = Database::initialize_from_config_dir(config_dir).await?;
    let transcript = database.transcript(session_id).await?;

    println!(
        "Session {} ({})",
        style(&transcript.session.session_id).cyan(),
        transcript.session.agent_id
    );
    println!("{}", "=".repeat(80));
    for turn in &transcript.turns {
        let speaker = match turn.role {
            TurnRole::User => style("user").bold().green(),
            TurnRole::Assistant => style("assistant").bold().blue(),
        };
        let status = match turn.status {
            TurnStatus::Complete => String::new(),
            other => format!(" [{other}]"),
        };
        println!("{speaker}{status}:");
        println!("{}", turn.content);
        println!();
    }
    Ok(())
}

#[inline]
pub async fn delete_session(config_dir: &Path, session_id: &str) -> Result<()> {
    let database = Database::initialize_from_config_dir(config_dir).await?;
    if database.delete_session(session_id).await? {
        println!("Deleted session {session_id}");
    } else {
        warn!("Session {} does not exist", session_id);
        println!("No session with ID {session_id}");
    }
    Ok(())
}

/// Report on the configuration, model endpoint, vector store and session store
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).unwrap_or_else(|_| Config::with_base_dir(config_dir));

    println!("📊 PDF RAG Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Session Store:");
    match Database::initialize_from_config_dir(config_dir).await {
        Ok(database) => {
            println!("   ✅ SQLite: Connected");
            match database.list_sessions(None).await {
                Ok(sessions) => println!("   💬 Sessions: {}", sessions.len()),
                Err(e) => println!("   ⚠️  Sessions: Unknown - {}", e),
            }
        }
        Err(e) => println!("   ❌ SQLite: Failed to connect - {}", e),
    }

    println!("🤖 Model Endpoint:");
    match OpenAiClient::new(&config.model) {
        Ok(client) => match client.health_check() {
            Ok(()) => {
                println!("   ✅ Endpoint: Connected ({})", client.base_url());
                println!("   💭 Chat Model: {}", config.model.chat_model);
                println!(
                    "   🔢 Embedding Model: {} ({} dims)",
                    config.model.embedding_model, config.model.embedding_dimension
                );
            }
            Err(e) => println!("   ⚠️  Endpoint: Unreachable - {}", e),
        },
        Err(e) => println!("   ❌ Endpoint: Invalid configuration - {}", e),
    }

    println!("🔍 Vector Store:");
    match VectorStore::from_config(&config).await {
        Ok(store) => match store.collection_info().await {
            Ok(info) if info.exists => {
                println!("   ✅ LanceDB: Connected");
                println!("   📚 Collection: {} ({} chunks)", info.collection, info.rows);
                if let Some(dimension) = info.dimension {
                    println!("   📐 Dimension: {}", dimension);
                }
            }
            Ok(info) => {
                println!("   ✅ LanceDB: Connected");
                println!(
                    "   💤 Collection: {} (not loaded yet, run `pdf-rag load`)",
                    info.collection
                );
            }
            Err(e) => println!("   ⚠️  Collection: Unknown - {}", e),
        },
        Err(e) => println!("   ❌ LanceDB: Failed to open - {}", e),
    }

    println!();
    println!("📄 Sources:");
    for source in &config.knowledge.sources {
        println!("   {}", source);
    }
    Ok(())
}

/// Load the knowledge base with upsert and serve the playground
#[inline]
pub async fn serve_playground(
    config_dir: &Path,
    load: bool,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let runtime = Runtime::open(load_config(config_dir)?).await?;

    if load {
        let report = runtime
            .knowledge
            .load(LoadOptions {
                upsert: true,
                recreate: false,
            })
            .await
            .context("Failed to load knowledge base")?;
        print_load_report(&report);
    }

    let database = Database::initialize_from_config_dir(&runtime.config.base_dir).await?;
    let recovered = database.recover_interrupted_turns().await?;
    if recovered > 0 {
        warn!("Marked {} interrupted turn(s) as cancelled", recovered);
    }

    let host = host.unwrap_or_else(|| runtime.config.playground.host.clone());
    let port = port.unwrap_or(runtime.config.playground.port);
    let playground = Arc::new(Playground::new(vec![runtime.agent()], database));

    println!(
        "{} http://{}:{}/v1/playground",
        style("Playground available at").green(),
        host,
        port
    );
    routes::serve(playground, &host, port).await?;
    Ok(())
}
