use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::write_atomic;
use crate::error::ChannelError;
use crate::ingest::{ChannelIngestor, ChannelReport, StopReason};

/// Final state of one channel in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Every pending message was processed.
    Completed,
    /// Stopped by the per-run cap; the next run continues.
    Capped,
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub username: String,
    #[serde(default)]
    pub title: Option<String>,
    pub processed: usize,
    /// Messages the sink already held, e.g. after a crash between emit and checkpoint.
    #[serde(default)]
    pub duplicates: usize,
    #[serde(default)]
    pub media_failures: usize,
    #[serde(flatten)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub last_message_id: Option<i64>,
}

impl ChannelOutcome {
    fn from_report(report: ChannelReport) -> Self {
        let status = match report.stop {
            StopReason::Boundary | StopReason::Exhausted => ChannelStatus::Completed,
            StopReason::Capped => ChannelStatus::Capped,
            StopReason::Cancelled => ChannelStatus::Cancelled,
        };
        Self {
            username: report.username,
            title: Some(report.title),
            processed: report.processed,
            duplicates: report.duplicates,
            media_failures: report.media_failures,
            status,
            last_message_id: Some(report.checkpoint.last_message_id),
        }
    }

    fn failed(username: &str, err: &ChannelError) -> Self {
        Self {
            username: username.to_string(),
            title: None,
            processed: 0,
            duplicates: 0,
            media_failures: 0,
            status: ChannelStatus::Failed {
                reason: err.to_string(),
            },
            last_message_id: None,
        }
    }

    fn cancelled(username: &str) -> Self {
        Self {
            username: username.to_string(),
            title: None,
            processed: 0,
            duplicates: 0,
            media_failures: 0,
            status: ChannelStatus::Cancelled,
            last_message_id: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ChannelStatus::Failed { .. })
    }
}

/// Aggregated result of one run over all configured channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: Vec<ChannelOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.channels.iter().any(ChannelOutcome::is_failed)
    }

    /// Channels worth retrying: failed or cancelled before finishing.
    pub fn failed_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.is_failed() || c.status == ChannelStatus::Cancelled)
            .map(|c| c.username.clone())
            .collect()
    }

    pub fn total_processed(&self) -> usize {
        self.channels.iter().map(|c| c.processed).sum()
    }

    /// Human-readable report, one line per channel.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Run {} finished: {} message(s) from {} channel(s)\n",
            self.run_id,
            self.total_processed(),
            self.channels.len()
        );
        for c in &self.channels {
            let status = match &c.status {
                ChannelStatus::Completed => "completed".to_string(),
                ChannelStatus::Capped => "partial (cap reached)".to_string(),
                ChannelStatus::Cancelled => "cancelled".to_string(),
                ChannelStatus::Failed { reason } => format!("FAILED: {}", reason),
            };
            out.push_str(&format!("  - {}: {} new, {}", c.username, c.processed, status));
            if c.duplicates > 0 {
                out.push_str(&format!(" ({} already stored)", c.duplicates));
            }
            if c.media_failures > 0 {
                out.push_str(&format!(" ({} media failure(s))", c.media_failures));
            }
            out.push('\n');
        }
        out
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)
            .await
            .with_context(|| format!("Failed to write run summary: {}", path.display()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run summary: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run summary: {}", path.display()))
    }
}

/// Runs the channel ingestor over a channel list, isolating failures.
#[derive(Clone)]
pub struct RunCoordinator {
    ingestor: ChannelIngestor,
    concurrency: usize,
    summary_path: Option<PathBuf>,
}

impl RunCoordinator {
    pub fn new(ingestor: ChannelIngestor, concurrency: usize) -> Self {
        Self {
            ingestor,
            concurrency: concurrency.max(1),
            summary_path: None,
        }
    }

    /// Persist every run summary to `path`.
    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    pub async fn run(&self, channels: &[String], cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "Run {} started for {} channel(s), concurrency {}",
            run_id,
            channels.len(),
            self.concurrency
        );

        let outcomes: Vec<ChannelOutcome> = futures::stream::iter(channels.to_vec())
            .map(|username| {
                let this = self.clone();
                let cancel = cancel.clone();
                async move { this.run_channel(&username, &cancel).await }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            channels: outcomes,
        };

        let failed = summary.failed_channels();
        if failed.is_empty() {
            info!("Run {} finished: {} new message(s)", run_id, summary.total_processed());
        } else {
            warn!(
                "Run {} finished with {} channel(s) to retry: {}",
                run_id,
                failed.len(),
                failed.join(", ")
            );
        }

        if let Some(path) = &self.summary_path {
            if let Err(e) = summary.save(path).await {
                error!("{:#}", e);
            }
        }
        summary
    }

    async fn run_channel(&self, username: &str, cancel: &CancellationToken) -> ChannelOutcome {
        if cancel.is_cancelled() {
            return ChannelOutcome::cancelled(username);
        }

        let span = info_span!("channel", channel = %username);
        match self.ingestor.ingest(username, cancel).instrument(span).await {
            Ok(report) => {
                info!("Scraped data from {}.", username);
                ChannelOutcome::from_report(report)
            }
            Err(e @ ChannelError::AlreadyRunning(_)) => {
                warn!("{}", e);
                ChannelOutcome::failed(username, &e)
            }
            Err(e) => {
                error!("Error while scraping {}: {}", username, e);
                ChannelOutcome::failed(username, &e)
            }
        }
    }
}
