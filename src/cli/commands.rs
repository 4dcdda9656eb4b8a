use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Cascading retry router for topic-based message streams")]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the retry topic sequence for a primary topic
    ///
    /// Examples:
    ///   cascade topics --topic orders --levels 3
    Topics {
        /// Primary topic name. Defaults to the configured topic
        #[arg(short, long)]
        topic: Option<String>,
        /// Number of retry levels. Defaults to the configured count
        #[arg(short, long)]
        levels: Option<usize>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run a service against the in-memory broker with a flaky processor
    ///
    /// Every message is produced to the primary topic; the processor fails
    /// at random with the given probability, so messages travel through the
    /// retry levels and the exhausted ones end up dead-lettered.
    ///
    /// Examples:
    ///   cascade simulate
    ///   cascade simulate --messages 500 --failure-rate 0.7
    Simulate {
        /// Number of messages to produce
        #[arg(short, long, default_value_t = 100)]
        messages: usize,
        /// Probability in [0, 1] that a single processing attempt fails
        #[arg(short, long, default_value_t = 0.3)]
        failure_rate: f64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the default configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default configuration file (overwrites existing)
    Init,
}
