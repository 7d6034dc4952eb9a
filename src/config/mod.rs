// Configuration management module
// TOML settings for the model endpoint, knowledge base, agent and playground

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    AgentConfig, Config, ConfigError, KnowledgeConfig, ModelConfig, PlaygroundConfig,
};

/// Resolve the configuration directory, preferring an explicit override
#[inline]
pub fn get_config_dir(
    override_dir: Option<&std::path::Path>,
) -> Result<std::path::PathBuf, ConfigError> {
    match override_dir {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Config::default_config_dir(),
    }
}
