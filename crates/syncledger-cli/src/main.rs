mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "syncledger",
    version,
    about = "Record bookkeeping and checkpoint reconciliation for replication syncs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded message log through the tracker
    Replay {
        /// Path to a JSONL file of `{"origin": .., "message": ..}` lines
        messages: PathBuf,
        /// Path to replication config YAML file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a replication config
    Check {
        /// Path to replication config YAML file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Replay { messages, config } => {
            commands::replay::execute(&messages, &config).await
        }
        Commands::Check { config } => commands::check::execute(&config),
    }
}
