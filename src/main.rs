use anyhow::Result;
use cascade::cascade::RetryTopicSequence;
use cascade::cli::{run_simulation, Cli, Commands, ConfigCommand};
use cascade::config::CascadeConfig;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Load the configuration from `path`, or from the default location
fn load_config(path: Option<&PathBuf>) -> Result<CascadeConfig> {
    match path {
        Some(path) => CascadeConfig::load(path),
        None => CascadeConfig::load_or_create_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Topics { topic, levels } => {
            let config = load_config(cli.config.as_ref())?;
            let topic = topic.unwrap_or(config.topic);
            let levels = levels.unwrap_or(config.retry_levels);

            let sequence = RetryTopicSequence::generate(topic.as_str(), levels);
            if sequence.is_empty() {
                info!("No retry levels configured for '{}'; failures go straight to the dead-letter sink", topic);
            }
            for (level, name) in sequence.iter().enumerate() {
                println!("{}\t{}", level + 1, name);
            }
        }
        Commands::Config { command } => match command {
            ConfigCommand::Path => match CascadeConfig::default_config_file() {
                Ok(path) => {
                    info!("Default configuration path: {}", path.display());
                    if path.exists() {
                        info!("✓ Configuration file exists");
                    } else {
                        info!("✗ Configuration file does not exist");
                        info!("Run 'cascade config init' to create one");
                    }
                }
                Err(e) => {
                    error!("Failed to determine configuration path: {}", e);
                }
            },
            ConfigCommand::Show => {
                let config = load_config(cli.config.as_ref())?;
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigCommand::Init => {
                let path = match cli.config {
                    Some(path) => path,
                    None => CascadeConfig::default_config_file()?,
                };
                if path.exists() {
                    warn!("A configuration already exists at: {}", path.display());
                    warn!("This will overwrite the existing configuration!");
                }
                CascadeConfig::default().save(&path)?;
                info!("Configuration written to: {}", path.display());
            }
        },
        Commands::Simulate {
            messages,
            failure_rate,
        } => {
            let config = load_config(cli.config.as_ref())?;
            info!(
                "Simulating {} messages on '{}' with {} retry levels (failure rate {})",
                messages, config.topic, config.retry_levels, failure_rate
            );

            let report = tokio::select! {
                report = run_simulation(&config, messages, failure_rate) => report?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Simulation interrupted");
                    return Ok(());
                }
            };
            print!("{}", report);
        }
    }

    Ok(())
}
