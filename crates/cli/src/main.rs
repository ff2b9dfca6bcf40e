//! PocketCode CLI, the main entry point.
//!
//! Commands:
//! - `chat`    Interactive or single-message session on the project
//! - `models`  List configured models and what each provider serves
//! - `config`  Show, locate or initialize the configuration file

use clap::{Parser, Subcommand};
use pocketcode_core::AgentMode;

mod commands;
mod terminal;

#[derive(Parser)]
#[command(
    name = "pocketcode",
    about = "PocketCode: an AI coding assistant for your project",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant about the project
    Chat {
        /// Model id (defaults to `default_model`)
        #[arg(short, long)]
        model: Option<String>,

        /// Send a single message instead of entering interactive mode
        #[arg(short = 'M', long)]
        message: Option<String>,

        /// copilot (review changes) or agent (apply immediately)
        #[arg(long)]
        mode: Option<AgentMode>,
    },

    /// List configured models and those each provider advertises
    Models,

    /// Show the configuration (API keys redacted)
    Config {
        /// Write a default config file
        #[arg(long)]
        init: bool,

        /// Print the config file path
        #[arg(long, conflicts_with = "init")]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            model,
            message,
            mode,
        } => commands::chat::run(model, message, mode).await?,
        Commands::Models => commands::models::run().await?,
        Commands::Config { init: true, .. } => commands::config_cmd::init().await?,
        Commands::Config { path: true, .. } => commands::config_cmd::path().await?,
        Commands::Config { .. } => commands::config_cmd::show().await?,
    }

    Ok(())
}
