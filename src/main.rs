//! appforge CLI entry point.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = appforge::cli::parse_cli();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli.log_level))
        .init();

    appforge::cli::run_with_cli(cli).await
}

/// RUST_LOG wins when set; otherwise the `--log-level` flag applies
/// (whose clap default is "info").
fn log_filter(cli_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli_level))
}
