mod app;
mod checkpoint;
mod config;
mod coordinator;
mod error;
mod ingest;
mod media;
mod notify;
mod retry;
mod scheduler;
mod sink;
mod source;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{App, Selection};
use crate::config::{Config, LoggingConfig, SinkKind};
use crate::scheduler::IngestScheduler;

#[derive(Parser)]
#[command(name = "rustscraper", version, about = "Incremental Telegram channel ingester")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RUSTSCRAPER_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest every configured channel once
    Run {
        /// Restrict the run to these channels (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Retry only the channels that failed in the previous run
        #[arg(long, conflicts_with = "channels")]
        only_failed: bool,
    },
    /// Run on the configured cron schedule until interrupted
    Schedule,
    /// Show stored checkpoints and the last run summary
    Status,
}

fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,rustscraper=debug".into());

    match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight messages");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let _log_guard = init_logging(&config.logging);

    info!("Configuration loaded from: {}", cli.config.display());
    info!("  Raw data: {}", config.storage.raw_data_dir.display());
    info!("  Media: {}", config.storage.content_dir().display());
    match config.storage.sink {
        SinkKind::Sqlite => info!("  Database: {}", config.storage.database_path.display()),
        SinkKind::Csv => info!("  CSV: {}", config.storage.csv_path().display()),
        SinkKind::Both => info!(
            "  Database: {}, CSV: {}",
            config.storage.database_path.display(),
            config.storage.csv_path().display()
        ),
    }
    info!(
        "  Cap: {} message(s) per channel, concurrency {}",
        config.ingest.max_messages_per_run, config.ingest.concurrency
    );

    let app = Arc::new(App::new(config)?);

    match cli.command.unwrap_or(Command::Run {
        channels: Vec::new(),
        only_failed: false,
    }) {
        Command::Run {
            channels,
            only_failed,
        } => {
            let selection = if only_failed {
                Selection::PreviouslyFailed
            } else if channels.is_empty() {
                Selection::All
            } else {
                Selection::Only(
                    channels
                        .iter()
                        .map(|c| c.trim_start_matches('@').to_string())
                        .collect(),
                )
            };

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let summary = app.run_once(&selection, &cancel).await?;
            println!("{}", summary.render());
            if summary.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Schedule => run_scheduled(app).await?,
        Command::Status => println!("{}", app.status().await?),
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_scheduled(app: Arc<App>) -> Result<()> {
    let cron = app
        .config()
        .schedule
        .as_ref()
        .map(|s| s.cron.clone())
        .context("No [schedule] section in config")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let scheduler = IngestScheduler::new(app, cancel).await?;
    scheduler.schedule(&cron).await?;
    scheduler.run_until_cancelled().await
}
