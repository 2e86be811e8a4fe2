use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{App, Selection};
use crate::coordinator::RunSummary;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Recurring ingestion runs on a cron schedule, until `cancel` fires.
pub struct IngestScheduler {
    inner: JobScheduler,
    app: Arc<App>,
    cancel: CancellationToken,
}

impl IngestScheduler {
    pub async fn new(app: Arc<App>, cancel: CancellationToken) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner, app, cancel })
    }

    /// Register the ingestion job under a six-field cron expression.
    pub async fn schedule(&self, cron_expr: &str) -> Result<Uuid> {
        let task = ingest_job(self.app.clone(), self.cancel.clone());
        let job = Job::new_async(cron_expr, move |_uuid, _lock| task())
            .with_context(|| format!("Invalid cron expression: {}", cron_expr))?;

        let id = self
            .inner
            .add(job)
            .await
            .context("Failed to add ingestion job")?;
        info!("Scheduled ingestion with cron: {}", cron_expr);
        Ok(id)
    }

    /// Run one pass right away, then keep the schedule going until
    /// cancelled. Returns once the in-flight run has wound down.
    pub async fn run_until_cancelled(mut self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");

        tick(&self.app, &self.cancel).await;

        self.cancel.cancelled().await;
        info!("Stopping scheduler");
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;

        self.app.wait_idle().await;
        info!("Scheduler stopped");
        Ok(())
    }
}

/// The body of every scheduled tick, ready to hand to the cron scheduler.
pub fn ingest_job(
    app: Arc<App>,
    cancel: CancellationToken,
) -> impl Fn() -> JobFuture + Send + Sync + 'static {
    move || {
        let app = app.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            tick(&app, &cancel).await;
        })
    }
}

/// One scheduled pass over every configured channel. Skipped when the
/// previous pass is still running.
pub async fn tick(app: &App, cancel: &CancellationToken) -> Option<RunSummary> {
    match app.run_once(&Selection::All, cancel).await {
        Ok(summary) => {
            if summary.has_failures() {
                warn!(
                    "Scheduled run finished with failures: {}",
                    summary.failed_channels().join(", ")
                );
            } else {
                info!(
                    "Scheduled run finished, {} message(s) processed",
                    summary.total_processed()
                );
            }
            Some(summary)
        }
        Err(e) => {
            warn!("Scheduled run skipped: {:#}", e);
            None
        }
    }
}
