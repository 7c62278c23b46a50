//! Supervisor daemon entry point: load config, assemble services, run the
//! lifecycle loop until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use overseer::config::Config;
use overseer::services::services;

#[derive(Parser)]
#[command(
    name = "overseer",
    about = "Lifecycle supervisor for fleets of AI coding-agent sessions",
    version
)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll interval in seconds.
    #[arg(short, long, default_value_t = 30)]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let services = services(cli.config.clone()).await?;
    let _log_guard = init_tracing(&services.config);

    tracing::info!(
        projects = services.config.projects.len(),
        interval_secs = cli.interval,
        "Overseer starting"
    );

    services
        .lifecycle
        .start(Duration::from_secs(cli.interval.max(1)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    services.lifecycle.stop().await;

    Ok(())
}

/// Env filter from `RUST_LOG`, falling back to the configured level.
/// With a log directory configured, output goes to a daily-rotated file.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.file {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "overseer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
