//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;

use crate::checkpoint::{Checkpoint, CheckpointLock, CheckpointStore};
use crate::config::Config;
use crate::error::SourceError;
use crate::sink::{NormalizedRecord, RecordSink, UpsertOutcome};
use crate::source::{ChannelInfo, MediaDescriptor, Message, MessageSource, MessageStream};

pub fn message(id: i64) -> Message {
    Message {
        id,
        text: Some(format!("message {}", id)),
        timestamp: DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap(),
        media: MediaDescriptor::None,
    }
}

impl Message {
    pub fn with_media(mut self, media: MediaDescriptor) -> Self {
        self.media = media;
        self
    }
}

/// Newest-first messages with ids `high..=low`.
pub fn messages_desc(high: i64, low: i64) -> Vec<Message> {
    (low..=high).rev().map(message).collect()
}

#[derive(Default)]
struct FakeChannel {
    title: String,
    messages: Vec<Message>,
    resolve_error: Option<SourceError>,
    fail_stream_after: Option<usize>,
}

/// Scripted message source.
#[derive(Default)]
pub struct FakeSource {
    channels: Mutex<HashMap<String, FakeChannel>>,
    failing_media: Mutex<HashSet<(String, i64)>>,
    downloads: AtomicUsize,
    resolves: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, username: &str, messages: Vec<Message>) -> Self {
        self.set_messages(username, messages);
        self
    }

    /// Replace the upstream messages of a channel (newest-first).
    pub fn set_messages(&self, username: &str, messages: Vec<Message>) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels.entry(username.to_string()).or_default();
        channel.title = format!("{} title", username);
        channel.messages = messages;
    }

    pub fn fail_resolve(&self, username: &str, err: SourceError) {
        let mut channels = self.channels.lock().unwrap();
        channels.entry(username.to_string()).or_default().resolve_error = Some(err);
    }

    pub fn fail_stream_after(&self, username: &str, count: usize) {
        let mut channels = self.channels.lock().unwrap();
        channels.entry(username.to_string()).or_default().fail_stream_after = Some(count);
    }

    pub fn fail_media(&self, username: &str, message_id: i64) {
        self.failing_media
            .lock()
            .unwrap()
            .insert((username.to_string(), message_id));
    }

    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn resolve(&self, username: &str) -> Result<ChannelInfo, SourceError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let channels = self.channels.lock().unwrap();
        match channels.get(username) {
            Some(FakeChannel {
                resolve_error: Some(err),
                ..
            }) => Err(err.clone()),
            Some(channel) => Ok(ChannelInfo {
                title: channel.title.clone(),
            }),
            None => Err(SourceError::ChannelNotFound(username.to_string())),
        }
    }

    fn messages<'a>(&'a self, username: &'a str) -> MessageStream<'a> {
        let channels = self.channels.lock().unwrap();
        let (messages, fail_after) = channels
            .get(username)
            .map(|c| (c.messages.clone(), c.fail_stream_after))
            .unwrap_or_default();

        let mut items: Vec<Result<Message, SourceError>> = messages.into_iter().map(Ok).collect();
        if let Some(n) = fail_after {
            items.truncate(n);
            items.push(Err(SourceError::Unavailable("connection reset".into())));
        }
        futures::stream::iter(items).boxed()
    }

    async fn download_media(
        &self,
        username: &str,
        message: &Message,
    ) -> Result<Vec<u8>, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_media
            .lock()
            .unwrap()
            .contains(&(username.to_string(), message.id));
        if failing {
            return Err(SourceError::Unavailable("media timeout".into()));
        }
        Ok(format!("media:{}:{}", username, message.id).into_bytes())
    }
}

/// Upserting sink that keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<NormalizedRecord>>,
    emitted: AtomicUsize,
    fail_on: Mutex<Option<i64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the record with this message id.
    pub fn fail_on(&self, message_id: i64) {
        *self.fail_on.lock().unwrap() = Some(message_id);
    }

    /// Every upsert call, duplicates included.
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    pub fn ids(&self, channel: &str) -> Vec<i64> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.channel_username == channel)
            .map(|r| r.message_id)
            .collect()
    }

    pub fn record(&self, channel: &str, message_id: i64) -> Option<NormalizedRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.channel_username == channel && r.message_id == message_id)
            .cloned()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn upsert(&self, record: &NormalizedRecord) -> anyhow::Result<UpsertOutcome> {
        if *self.fail_on.lock().unwrap() == Some(record.message_id) {
            anyhow::bail!("disk full");
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let exists = records.iter().any(|r| {
            r.channel_username == record.channel_username && r.message_id == record.message_id
        });
        if exists {
            return Ok(UpsertOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn count(&self, channel: &str) -> anyhow::Result<usize> {
        Ok(self.ids(channel).len())
    }
}

/// Checkpoint store that records every save.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<HashMap<String, Checkpoint>>,
    history: Mutex<Vec<(String, Checkpoint)>>,
    fail_saves: Mutex<bool>,
    locked: Arc<Mutex<HashSet<String>>>,
}

struct MemoryLease {
    locked: Arc<Mutex<HashSet<String>>>,
    channel: String,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if let Ok(mut locked) = self.locked.lock() {
            locked.remove(&self.channel);
        }
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, channel: &str, checkpoint: Checkpoint) {
        self.current
            .lock()
            .unwrap()
            .insert(channel.to_string(), checkpoint);
    }

    pub fn get(&self, channel: &str) -> Checkpoint {
        self.current
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_saves(&self) {
        *self.fail_saves.lock().unwrap() = true;
    }

    pub fn saves(&self, channel: &str) -> Vec<Checkpoint> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, cp)| cp.clone())
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn try_lock(&self, channel: &str) -> std::io::Result<Option<CheckpointLock>> {
        if !self.locked.lock().unwrap().insert(channel.to_string()) {
            return Ok(None);
        }
        Ok(Some(CheckpointLock::new(MemoryLease {
            locked: self.locked.clone(),
            channel: channel.to_string(),
        })))
    }

    async fn load(&self, channel: &str) -> Checkpoint {
        self.get(channel)
    }

    async fn save(&self, channel: &str, checkpoint: &Checkpoint) -> std::io::Result<()> {
        if *self.fail_saves.lock().unwrap() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            ));
        }
        self.set(channel, checkpoint.clone());
        self.history
            .lock()
            .unwrap()
            .push((channel.to_string(), checkpoint.clone()));
        Ok(())
    }

    fn location(&self, channel: &str) -> PathBuf {
        PathBuf::from(format!("memory://{}", channel))
    }
}

/// Config rooted in `dir`, ingesting channel `abc` from `base_url`.
pub fn config_in(dir: &Path, base_url: &str) -> Config {
    let content = format!(
        r#"
        channels = ["abc"]

        [source]
        base_url = "{base_url}"

        [storage]
        raw_data_dir = "{raw}"
        database_path = "{db}"

        [retry]
        max_attempts = 1
        "#,
        raw = dir.join("raw").display(),
        db = dir.join("messages.db").display(),
    );
    Config::parse(&content).unwrap()
}
