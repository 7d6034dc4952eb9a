use anyhow::Result;
use clap::{Parser, Subcommand};
use pdf_rag::commands::{
    ask, delete_session, list_sessions, load_sources, search_knowledge, serve_playground,
    show_session, show_status,
};
use pdf_rag::config::{get_config_dir, run_interactive_config, show_config};
use pdf_rag::database::lancedb::SearchMode;
use pdf_rag::knowledge::LoadOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pdf-rag")]
#[command(about = "Question answering over PDF documents with a retrieval-augmented agent")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the local databases
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the model endpoint and knowledge base
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Fetch, chunk and index PDF sources into the vector store
    Load {
        /// PDF URLs or paths; defaults to the configured sources
        sources: Vec<String>,
        /// Overwrite chunks that are already stored
        #[arg(long)]
        upsert: bool,
        /// Drop the collection before loading
        #[arg(long)]
        recreate: bool,
    },
    /// Search the knowledge base without the agent
    Search {
        query: String,
        /// dense, keyword or hybrid
        #[arg(long)]
        mode: Option<SearchMode>,
        /// Number of chunks to return
        #[arg(short = 'k', long)]
        k: Option<usize>,
    },
    /// Ask the agent a question and stream the answer
    Ask {
        query: String,
        /// Let the model decide when to search the knowledge base
        #[arg(long, conflicts_with = "add_context")]
        agentic: bool,
        /// Always retrieve and add references to the prompt
        #[arg(long)]
        add_context: bool,
        /// Record the exchange in an existing session
        #[arg(long)]
        session: Option<String>,
    },
    /// Inspect stored chat sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Show status of the model endpoint and stores
    Status,
    /// Load the knowledge base and start the playground server
    Serve {
        /// Skip loading sources before serving
        #[arg(long)]
        no_load: bool,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List stored sessions
    List {
        /// Only sessions of this agent
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print a session transcript
    Show { session_id: String },
    /// Delete a session and its turns
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir.as_deref())?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Load {
            sources,
            upsert,
            recreate,
        } => {
            load_sources(&config_dir, sources, LoadOptions { upsert, recreate }).await?;
        }
        Commands::Search { query, mode, k } => {
            search_knowledge(&config_dir, &query, mode, k).await?;
        }
        Commands::Ask {
            query,
            agentic,
            add_context,
            session,
        } => {
            ask(&config_dir, &query, agentic, add_context, session.as_deref()).await?;
        }
        Commands::Sessions { command } => match command {
            SessionCommands::List { agent } => {
                list_sessions(&config_dir, agent.as_deref()).await?;
            }
            SessionCommands::Show { session_id } => {
                show_session(&config_dir, &session_id).await?;
            }
            SessionCommands::Delete { session_id } => {
                delete_session(&config_dir, &session_id).await?;
            }
        },
        Commands::Status => {
            show_status(&config_dir).await?;
        }
        Commands::Serve {
            no_load,
            host,
            port,
        } => {
            serve_playground(&config_dir, !no_load, host, port).await?;
        }
    }

    Ok(())
}
