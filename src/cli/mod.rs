//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// appforge: drive generation-and-analysis pipelines over model-built
/// apps.
#[derive(Debug, Parser)]
#[command(name = "appforge", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Operational commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator until interrupted.
    Serve {
        /// Use the in-memory backend instead of Postgres (local runs).
        #[arg(long)]
        memory: bool,
    },
    /// Create a pipeline in pending state and print its id.
    Create {
        /// Model slugs, comma separated, outer loop of the matrix.
        #[arg(long, value_delimiter = ',', required = true)]
        models: Vec<String>,
        /// Template ids, comma separated, inner loop of the matrix.
        #[arg(long, value_delimiter = ',', required = true)]
        templates: Vec<String>,
        /// Canonical tool names, comma separated; may be empty.
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
        /// Per-pipeline generation concurrency.
        #[arg(long)]
        max_concurrent_generation: Option<usize>,
        /// Per-pipeline analysis concurrency.
        #[arg(long)]
        max_concurrent_analysis: Option<usize>,
    },
    /// List persisted pipelines.
    List,
    /// Print one pipeline row as JSON.
    Show {
        /// Pipeline id.
        id: Uuid,
    },
    /// Cancel a pipeline; in-flight work drains, nothing new starts.
    Cancel {
        /// Pipeline id.
        id: Uuid,
    },
    /// Apply database migrations and exit.
    Migrate,
}

/// Parses process arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { memory } => commands::serve(memory).await,
        Command::Create {
            models,
            templates,
            tools,
            max_concurrent_generation,
            max_concurrent_analysis,
        } => {
            commands::create(
                models,
                templates,
                tools,
                max_concurrent_generation,
                max_concurrent_analysis,
            )
            .await
        }
        Command::List => commands::list().await,
        Command::Show { id } => commands::show(id).await,
        Command::Cancel { id } => commands::cancel(id).await,
        Command::Migrate => commands::migrate().await,
    }
}
