use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::ChannelError;
use crate::media::{MediaFetcher, MediaOutcome};
use crate::retry::RetryPolicy;
use crate::sink::{NormalizedRecord, RecordSink, UpsertOutcome};
use crate::source::{Message, MessageSource};

/// Phases of one channel's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Resolving,
    Streaming,
    Downloading,
    Emitting,
    Checkpointing,
    Done,
    Failed,
}

/// Why the message loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Reached a message covered by a previous run.
    Boundary,
    /// The source had no more messages.
    Exhausted,
    /// Hit the per-run message cap; older messages are left for the next run.
    Capped,
    Cancelled,
}

/// What to do with the next message of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Process,
    Skip,
    Stop,
}

/// Result of a successful channel run.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub username: String,
    pub title: String,
    pub processed: usize,
    pub duplicates: usize,
    pub media_failures: usize,
    pub stop: StopReason,
    pub checkpoint: Checkpoint,
}

/// Mutable bookkeeping of a single channel run.
struct ChannelRun<'a> {
    username: &'a str,
    title: String,
    state: IngestState,
    start: Checkpoint,
    saved: Checkpoint,
    max_seen: Option<i64>,
    lowest_processed: Option<i64>,
    previous_id: Option<i64>,
    processed: usize,
    duplicates: usize,
    media_failures: usize,
}

impl<'a> ChannelRun<'a> {
    fn new(username: &'a str) -> Self {
        Self {
            username,
            title: String::new(),
            state: IngestState::Resolving,
            start: Checkpoint::default(),
            saved: Checkpoint::default(),
            max_seen: None,
            lowest_processed: None,
            previous_id: None,
            processed: 0,
            duplicates: 0,
            media_failures: 0,
        }
    }

    fn transition(&mut self, next: IngestState) {
        if self.state != next {
            debug!("{}: {:?} -> {:?}", self.username, self.state, next);
            self.state = next;
        }
    }

    /// Ids must strictly decrease along the stream.
    fn check_order(&mut self, id: i64) -> Result<(), ChannelError> {
        if let Some(previous) = self.previous_id {
            if id >= previous {
                return Err(ChannelError::OutOfOrder {
                    channel: self.username.to_string(),
                    previous,
                    current: id,
                });
            }
        }
        self.previous_id = Some(id);
        Ok(())
    }

    fn classify(&self, id: i64) -> Step {
        if self.start.is_pending(id) {
            Step::Process
        } else if self.start.is_boundary(id) {
            Step::Stop
        } else {
            Step::Skip
        }
    }

    fn observe(&mut self, id: i64) {
        self.max_seen = Some(self.max_seen.map_or(id, |m| m.max(id)));
        self.lowest_processed = Some(self.lowest_processed.map_or(id, |l| l.min(id)));
        self.processed += 1;
    }

    /// Checkpoint claiming everything scanned down to `scanned_low`.
    fn checkpoint_at(&self, scanned_low: i64) -> Checkpoint {
        self.start.advance(self.max_seen, scanned_low)
    }

    /// Lower edge of the scanned region once the loop ended for `stop`.
    fn scanned_low(&self, stop: StopReason) -> i64 {
        match stop {
            StopReason::Boundary | StopReason::Exhausted => 0,
            StopReason::Capped | StopReason::Cancelled => {
                self.lowest_processed.unwrap_or(i64::MAX)
            }
        }
    }

    fn record(&self, message: &Message, media_path: Option<&Path>) -> NormalizedRecord {
        NormalizedRecord {
            channel_title: self.title.clone(),
            channel_username: self.username.to_string(),
            message_id: message.id,
            message_text: message.text.clone(),
            message_timestamp: message.timestamp,
            media_path: media_path.map(Path::to_path_buf),
            emoji_used: None,
            external_links: None,
        }
    }
}

/// Drives the per-channel state machine:
/// `Resolving -> Streaming -> (Downloading? -> Emitting -> Checkpointing)* -> Done | Failed`.
#[derive(Clone)]
pub struct ChannelIngestor {
    source: Arc<dyn MessageSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    media: Arc<MediaFetcher>,
    retry: RetryPolicy,
    max_messages_per_run: usize,
}

impl ChannelIngestor {
    pub fn new(
        source: Arc<dyn MessageSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
        media: Arc<MediaFetcher>,
        retry: RetryPolicy,
        max_messages_per_run: usize,
    ) -> Self {
        Self {
            source,
            checkpoints,
            sink,
            media,
            retry,
            max_messages_per_run: max_messages_per_run.max(1),
        }
    }

    /// Ingest new messages of one channel.
    ///
    /// The checkpoint is persisted after every processed message and once
    /// more when the loop ends, and never claims a message whose record was
    /// not accepted by the sink. On error, checkpoints already written stay
    /// valid; the next run re-emits whatever came after them.
    pub async fn ingest(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<ChannelReport, ChannelError> {
        let _lock = match self.checkpoints.try_lock(username).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return Err(ChannelError::AlreadyRunning(username.to_string())),
            Err(source) => {
                return Err(ChannelError::CheckpointLockFailed {
                    channel: username.to_string(),
                    path: self.checkpoints.location(username),
                    source,
                })
            }
        };

        let mut run = ChannelRun::new(username);
        match self.drive(&mut run, cancel).await {
            Ok(stop) => {
                run.transition(IngestState::Done);
                Ok(ChannelReport {
                    username: username.to_string(),
                    title: run.title,
                    processed: run.processed,
                    duplicates: run.duplicates,
                    media_failures: run.media_failures,
                    stop,
                    checkpoint: run.saved,
                })
            }
            Err(e) => {
                run.transition(IngestState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut ChannelRun<'_>,
        cancel: &CancellationToken,
    ) -> Result<StopReason, ChannelError> {
        let username = run.username;

        let resolved = self
            .retry
            .run_until_cancelled(&format!("resolve {}", username), cancel, || {
                self.source.resolve(username)
            })
            .await;

        run.start = self.checkpoints.load(username).await;
        run.saved = run.start.clone();

        let Some(resolved) = resolved else {
            info!("Cancelled while resolving {}", username);
            return Ok(StopReason::Cancelled);
        };
        run.title = resolved
            .map_err(|e| ChannelError::from_source(username, e))?
            .title;

        if run.start.is_first_run() {
            info!("First run for {} ({})", username, run.title);
        } else {
            debug!(
                "Resuming {} after message {} ({} backfill gap(s))",
                username,
                run.start.last_message_id,
                run.start.backfill.len()
            );
        }

        run.transition(IngestState::Streaming);
        let mut stream = self.source.messages(username);

        let stop = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                next = stream.next() => next,
            };

            let message = match next {
                None => break StopReason::Exhausted,
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(ChannelError::from_source(username, e)),
            };

            run.check_order(message.id)?;
            match run.classify(message.id) {
                Step::Stop => break StopReason::Boundary,
                Step::Skip => continue,
                Step::Process => {}
            }

            self.process(run, &message).await?;
            run.transition(IngestState::Streaming);

            if run.processed >= self.max_messages_per_run {
                break StopReason::Capped;
            }
        };
        drop(stream);

        let final_checkpoint = run.checkpoint_at(run.scanned_low(stop));
        // The cap fell on the last pending message: nothing is owed.
        let stop = if stop == StopReason::Capped && final_checkpoint.backfill.is_empty() {
            StopReason::Boundary
        } else {
            stop
        };
        if final_checkpoint != run.saved {
            run.transition(IngestState::Checkpointing);
            self.persist(run, final_checkpoint).await?;
        }

        if run.processed == 0 {
            info!("No new messages found for {}.", username);
        } else {
            info!(
                "Processed {} message(s) from {} ({:?}), checkpoint at {}",
                run.processed, username, stop, run.saved.last_message_id
            );
        }
        Ok(stop)
    }

    /// Download, emit, then checkpoint a single message. Runs to completion
    /// once started, even if the run is being cancelled.
    async fn process(
        &self,
        run: &mut ChannelRun<'_>,
        message: &Message,
    ) -> Result<(), ChannelError> {
        if !message.media.is_none() {
            run.transition(IngestState::Downloading);
        }
        let media = self
            .media
            .fetch(self.source.as_ref(), run.username, message)
            .await;
        if media == MediaOutcome::Failed {
            run.media_failures += 1;
        }

        run.transition(IngestState::Emitting);
        let record = run.record(message, media.path());
        match self.sink.upsert(&record).await {
            Ok(UpsertOutcome::Inserted) => {}
            Ok(UpsertOutcome::Duplicate) => run.duplicates += 1,
            Err(e) => {
                return Err(ChannelError::SinkWriteFailed {
                    channel: run.username.to_string(),
                    message_id: message.id,
                    reason: format!("{:#}", e),
                })
            }
        }
        debug!("Processed message ID {} from {}.", message.id, run.username);

        run.observe(message.id);
        run.transition(IngestState::Checkpointing);
        let checkpoint = run.checkpoint_at(message.id);
        self.persist(run, checkpoint).await
    }

    async fn persist(
        &self,
        run: &mut ChannelRun<'_>,
        checkpoint: Checkpoint,
    ) -> Result<(), ChannelError> {
        if let Err(source) = self.checkpoints.save(run.username, &checkpoint).await {
            warn!("Checkpoint write failed for {}: {}", run.username, source);
            return Err(ChannelError::CheckpointWriteFailed {
                channel: run.username.to_string(),
                path: self.checkpoints.location(run.username),
                source,
            });
        }
        run.saved = checkpoint;
        Ok(())
    }
}
