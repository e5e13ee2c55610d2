// ABOUTME: CLI entry point for call-replicator
// ABOUTME: Parses commands, sets up logging, and routes to command handlers

use call_replicator::commands;
use call_replicator::ReplicatorArgs;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "call-replicator")]
#[command(about = "Replicate call-center records from a tunneled MySQL source into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate new records into fato_chamadas, forever or once
    Sync {
        #[command(flatten)]
        args: ReplicatorArgs,
        /// Run a single sync cycle and exit (don't run continuously)
        #[arg(long)]
        once: bool,
    },
    /// Show the destination watermark and row count
    Status {
        #[command(flatten)]
        args: ReplicatorArgs,
    },
    /// Export the whole source table as normalized CSV
    Export {
        #[command(flatten)]
        args: ReplicatorArgs,
        /// Output file (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Create the destination table and indexes if they are missing
    InitSchema {
        #[command(flatten)]
        args: ReplicatorArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment from .env must be in place before clap reads env fallbacks
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // Logs go to stderr so `export` can stream CSV on stdout.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync { args, once } => {
            let config = args.into_config()?;
            commands::sync(config, once).await
        }
        Commands::Status { args } => {
            let config = args.into_config()?;
            commands::status(&config).await
        }
        Commands::Export { args, output } => {
            let config = args.into_config()?;
            commands::export(&config, output.as_deref()).await
        }
        Commands::InitSchema { args } => {
            let config = args.into_config()?;
            commands::init_schema(&config).await
        }
    }
}
