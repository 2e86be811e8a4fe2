pub mod csv;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{SinkKind, StorageConfig};

pub use self::csv::CsvSink;
pub use self::sqlite::SqliteSink;

/// The unit emitted per processed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub channel_title: String,
    pub channel_username: String,
    pub message_id: i64,
    pub message_text: Option<String>,
    pub message_timestamp: DateTime<Utc>,
    pub media_path: Option<PathBuf>,
    /// Filled by downstream enrichment, always `None` here.
    pub emoji_used: Option<String>,
    /// Filled by downstream enrichment, always `None` here.
    pub external_links: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The key already existed; nothing was written.
    Duplicate,
}

/// Storage for normalized records with upsert-by-key semantics: emitting the
/// same `(channel_username, message_id)` twice must be a no-op.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertOutcome>;

    /// Number of records held for a channel.
    async fn count(&self, channel_username: &str) -> Result<usize>;
}

/// Writes every record to each inner sink in turn.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl RecordSink for FanoutSink {
    /// `Inserted` when any sink was missing the record. A failure leaves the
    /// sinks written so far as they are; the retried upsert is a no-op there.
    async fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::Duplicate;
        for sink in &self.sinks {
            if sink.upsert(record).await? == UpsertOutcome::Inserted {
                outcome = UpsertOutcome::Inserted;
            }
        }
        Ok(outcome)
    }

    async fn count(&self, channel_username: &str) -> Result<usize> {
        match self.sinks.first() {
            Some(sink) => sink.count(channel_username).await,
            None => Ok(0),
        }
    }
}

/// Open the sink(s) selected in `[storage]`.
pub fn open(storage: &StorageConfig) -> Result<Arc<dyn RecordSink>> {
    let sink: Arc<dyn RecordSink> = match storage.sink {
        SinkKind::Sqlite => Arc::new(SqliteSink::open(&storage.database_path)?),
        SinkKind::Csv => Arc::new(CsvSink::open(&storage.csv_path())?),
        SinkKind::Both => {
            let sqlite: Arc<dyn RecordSink> = Arc::new(SqliteSink::open(&storage.database_path)?);
            let csv: Arc<dyn RecordSink> = Arc::new(CsvSink::open(&storage.csv_path())?);
            Arc::new(FanoutSink::new(vec![sqlite, csv]))
        }
    };
    Ok(sink)
}
