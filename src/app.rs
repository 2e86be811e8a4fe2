use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::FileCheckpointStore;
use crate::config::Config;
use crate::coordinator::{RunCoordinator, RunSummary};
use crate::ingest::ChannelIngestor;
use crate::media::MediaFetcher;
use crate::notify::Notifier;
use crate::retry::RetryPolicy;
use crate::sink::{self, RecordSink};
use crate::source::HttpSource;

/// Which configured channels a run should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Only(Vec<String>),
    /// Channels that failed or were cancelled in the previous run.
    PreviouslyFailed,
}

/// Shared application state
pub struct App {
    config: Config,
    coordinator: RunCoordinator,
    checkpoints: FileCheckpointStore,
    sink: Arc<dyn RecordSink>,
    notifier: Option<Notifier>,
    run_lock: Mutex<()>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let source = HttpSource::new(config.source.clone(), retry)?;
        let sink = sink::open(&config.storage)?;
        let checkpoints = FileCheckpointStore::new(&config.storage.raw_data_dir);
        let media = MediaFetcher::new(config.storage.content_dir(), retry);

        let ingestor = ChannelIngestor::new(
            Arc::new(source),
            Arc::new(checkpoints.clone()),
            sink.clone(),
            Arc::new(media),
            retry,
            config.ingest.max_messages_per_run,
        );
        let coordinator = RunCoordinator::new(ingestor, config.ingest.concurrency)
            .with_summary_path(summary_path(&config));
        let notifier = config.notify.as_ref().map(Notifier::new);

        Ok(Self {
            config,
            coordinator,
            checkpoints,
            sink,
            notifier,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One ingestion pass. The channel list is re-read every time.
    pub async fn run_once(
        &self,
        selection: &Selection,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            anyhow::bail!("a run is already in progress, skipping");
        };

        let configured = self.config.load_channels()?;
        let previous = match selection {
            Selection::PreviouslyFailed => Some(
                RunSummary::load(&summary_path(&self.config))
                    .await
                    .context("No previous run to retry")?,
            ),
            _ => None,
        };
        let channels = select_channels(&configured, selection, previous.as_ref());
        info!("Loaded {} channel(s) for this run", channels.len());

        let summary = self.coordinator.run(&channels, cancel).await;
        if let Some(notifier) = &self.notifier {
            notifier.try_send_summary(&summary).await;
        }
        Ok(summary)
    }

    /// Resolves once no run is in progress.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    /// Stored checkpoints and the outcome of the last run.
    pub async fn status(&self) -> Result<String> {
        let mut out = String::from("Checkpoints:\n");
        let records = self.checkpoints.list().await?;
        if records.is_empty() {
            out.push_str("  (none)\n");
        }
        for record in &records {
            let stored = self.sink.count(&record.channel_username).await?;
            out.push_str(&format!(
                "  - {}: last message {}, {} stored",
                record.channel_username, record.checkpoint.last_message_id, stored
            ));
            if !record.checkpoint.backfill.is_empty() {
                let gaps: Vec<String> = record
                    .checkpoint
                    .backfill
                    .iter()
                    .map(|g| format!("{}..{}", g.floor + 1, g.ceiling - 1))
                    .collect();
                out.push_str(&format!(", backfill pending: {}", gaps.join(", ")));
            }
            if let Some(at) = record.updated_at {
                out.push_str(&format!(" (updated {})", at.to_rfc3339()));
            }
            out.push('\n');
        }

        match RunSummary::load(&summary_path(&self.config)).await {
            Ok(summary) => {
                out.push('\n');
                out.push_str(&summary.render());
            }
            Err(_) => out.push_str("\nNo run recorded yet.\n"),
        }
        Ok(out)
    }
}

fn summary_path(config: &Config) -> PathBuf {
    config.storage.raw_data_dir.join("last_run.json")
}

/// Apply `selection` to the configured channel list, keeping its order.
pub fn select_channels(
    configured: &[String],
    selection: &Selection,
    previous: Option<&RunSummary>,
) -> Vec<String> {
    let wanted: Vec<String> = match selection {
        Selection::All => return configured.to_vec(),
        Selection::Only(names) => names.clone(),
        Selection::PreviouslyFailed => previous.map(|s| s.failed_channels()).unwrap_or_default(),
    };

    for name in &wanted {
        if !configured.contains(name) {
            warn!("Channel {} is not configured, ignoring", name);
        }
    }
    configured
        .iter()
        .filter(|c| wanted.contains(c))
        .cloned()
        .collect()
}
