use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use super::{NormalizedRecord, RecordSink, UpsertOutcome};

pub const HEADER: [&str; 6] = [
    "Channel Title",
    "Channel Username",
    "ID",
    "Message",
    "Date",
    "Media Path",
];

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

struct CsvState {
    writer: csv::Writer<File>,
    keys: HashSet<(String, i64)>,
}

/// Append-only CSV export, one row per message. Rows already present in the
/// file are never written again.
pub struct CsvSink {
    state: Mutex<CsvState>,
}

impl CsvSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let keys = if path.exists() {
            read_keys(path)?
        } else {
            HashSet::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
        let empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        info!("CSV export at {} ({} row(s))", path.display(), keys.len());
        Ok(Self {
            state: Mutex::new(CsvState { writer, keys }),
        })
    }
}

/// `(username, id)` of every row already in the file.
fn read_keys(path: &Path) -> Result<HashSet<(String, i64)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

    let mut keys = HashSet::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        if let (Some(username), Some(Ok(id))) = (row.get(1), row.get(2).map(str::parse::<i64>)) {
            keys.insert((username.to_string(), id));
        }
    }
    Ok(keys)
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        let key = (record.channel_username.clone(), record.message_id);
        if state.keys.contains(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }

        let id = record.message_id.to_string();
        let date = record.message_timestamp.format(DATE_FORMAT).to_string();
        let media_path = record
            .media_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        state
            .writer
            .write_record([
                record.channel_title.as_str(),
                record.channel_username.as_str(),
                id.as_str(),
                record.message_text.as_deref().unwrap_or(""),
                date.as_str(),
                media_path.as_str(),
            ])
            .with_context(|| format!("Failed to write message {}", record.message_id))?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;

        state.keys.insert(key);
        Ok(UpsertOutcome::Inserted)
    }

    async fn count(&self, channel_username: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .keys
            .iter()
            .filter(|(username, _)| username == channel_username)
            .count())
    }
}
