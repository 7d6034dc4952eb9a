
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::Path;

use super::{Config, ConfigError, KnowledgeConfig, ModelConfig};
use crate::database::lancedb::SearchMode;

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 PDF RAG Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Model Endpoint").bold().yellow());
    eprintln!("Configure the OpenAI-compatible endpoint used for chat and embeddings.");
    eprintln!();

    configure_model(&mut config.model)?;

    eprintln!();
    eprintln!("{}", style("Knowledge Base").bold().yellow());
    configure_knowledge(&mut config.knowledge)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    if test_model_connection(&config.model)? {
        eprintln!("{}", style("✓ Model endpoint reachable!").green());
    } else {
        eprintln!(
            "{}",
            style("⚠ Warning: Could not reach the model endpoint").yellow()
        );
        eprintln!("You can continue, but loading and chatting will fail until it is reachable.");
    }

    if config.model.api_key().is_none() {
        eprintln!(
            "{} {}",
            style("⚠ No API key found in").yellow(),
            style(&config.model.api_key_env).cyan()
        );
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Model Endpoint:").bold().yellow());
    match config.model.base_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Chat Model: {}", style(&config.model.chat_model).cyan());
    eprintln!(
        "  Embedding Model: {} ({} dims)",
        style(&config.model.embedding_model).cyan(),
        config.model.embedding_dimension
    );
    eprintln!(
        "  API Key: {} ({})",
        style(&config.model.api_key_env).cyan(),
        if config.model.api_key().is_some() {
            style("set").green()
        } else {
            style("not set").red()
        }
    );

    eprintln!();
    eprintln!("{}", style("Knowledge Base:").bold().yellow());
    eprintln!("  Collection: {}", style(&config.knowledge.collection).cyan());
    for source in &config.knowledge.sources {
        eprintln!("  Source: {}", style(source).cyan());
    }
    eprintln!(
        "  Search: {} (top {}, dense {} / keyword {})",
        style(config.knowledge.search_mode).cyan(),
        config.knowledge.num_documents,
        config.knowledge.dense_weight,
        config.knowledge.keyword_weight
    );

    eprintln!();
    eprintln!("{}", style("Agent:").bold().yellow());
    eprintln!(
        "  {} ({})",
        style(&config.agent.name).cyan(),
        config.agent.agent_id
    );
    eprintln!("  Search knowledge: {}", config.agent.search_knowledge);
    eprintln!("  Read chat history: {}", config.agent.read_chat_history);

    eprintln!();
    eprintln!(
        "Playground: http://{}:{}",
        config.playground.host, config.playground.port
    );
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No valid configuration found. Using defaults.").yellow()
            );
            Ok(Config::with_base_dir(config_dir))
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_model(model: &mut ModelConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == model.protocol)
        .unwrap_or(1);

    let protocol_index = Select::new()
        .with_prompt("Endpoint protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Endpoint host")
        .default(model.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = ModelConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..ModelConfig::default()
            };
            temp_config.base_url()?;
            Ok(())
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Endpoint port")
        .default(model.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let chat_model: String = Input::new()
        .with_prompt("Chat model")
        .default(model.chat_model.clone())
        .validate_with(non_empty)
        .interact_text()?;

    let embedding_model: String = Input::new()
        .with_prompt("Embedding model")
        .default(model.embedding_model.clone())
        .validate_with(non_empty)
        .interact_text()?;

    let embedding_dimension: u32 = Input::new()
        .with_prompt("Embedding dimension")
        .default(model.embedding_dimension)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if (8..=8192).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 8 and 8192")
            }
        })
        .interact_text()?;

    model.set_protocol(protocol)?;
    model.set_host(host)?;
    model.set_port(port)?;
    model.set_chat_model(chat_model)?;
    model.set_embedding_model(embedding_model)?;
    model.set_embedding_dimension(embedding_dimension)?;

    Ok(())
}

fn configure_knowledge(knowledge: &mut KnowledgeConfig) -> Result<()> {
    let collection: String = Input::new()
        .with_prompt("Collection name")
        .default(knowledge.collection.clone())
        .validate_with(non_empty)
        .interact_text()?;

    let modes = [SearchMode::Hybrid, SearchMode::Dense, SearchMode::Keyword];
    let default_index = modes
        .iter()
        .position(|m| *m == knowledge.search_mode)
        .unwrap_or(0);
    let mode_index = Select::new()
        .with_prompt("Search mode")
        .default(default_index)
        .items(&modes)
        .interact()?;

    let num_documents: usize = Input::new()
        .with_prompt("Chunks per retrieval")
        .default(knowledge.num_documents)
        .interact_text()?;

    knowledge.set_collection(collection)?;
    knowledge.search_mode = modes[mode_index];
    knowledge.set_num_documents(num_documents)?;

    Ok(())
}

fn non_empty(input: &String) -> Result<(), &'static str> {
    if input.trim().is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}

fn test_model_connection(model: &ModelConfig) -> Result<bool> {
    let url = model.base_url()?.join("models")?;

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    let mut request = agent.get(url.as_str());
    if let Some(key) = model.api_key() {
        request = request.header("Authorization", format!("Bearer {}", key));
    }

    match request.call() {
        Ok(_) => Ok(true),
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => Ok(true),
        Err(_) => Ok(false),
    }
}
