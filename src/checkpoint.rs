use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Open interval `(floor, ceiling)` of message ids that exist below the
/// high-water mark but have not been processed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub floor: i64,
    pub ceiling: i64,
}

impl Gap {
    pub fn contains(&self, id: i64) -> bool {
        id > self.floor && id < self.ceiling
    }

    fn is_empty(&self) -> bool {
        self.ceiling - self.floor <= 1
    }
}

/// Per-channel progress cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Newest message id ever processed. 0 means the channel never ran.
    #[serde(alias = "last_id")]
    pub last_message_id: i64,
    /// Holes left by runs that stopped before reaching the previous boundary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backfill: Vec<Gap>,
}

impl Checkpoint {
    pub fn is_first_run(&self) -> bool {
        self.last_message_id == 0 && self.backfill.is_empty()
    }

    /// Whether a message with this id still needs processing.
    pub fn is_pending(&self, id: i64) -> bool {
        id > self.last_message_id || self.backfill.iter().any(|g| g.contains(id))
    }

    /// Whether every message at or below this id is already covered, i.e.
    /// iteration can stop here.
    pub fn is_boundary(&self, id: i64) -> bool {
        let lowest = self
            .backfill
            .iter()
            .map(|g| g.floor)
            .min()
            .unwrap_or(self.last_message_id);
        id <= lowest.min(self.last_message_id)
    }

    /// Checkpoint after a scan that processed every pending message with id
    /// `>= scanned_low` and saw `max_seen` as its largest id. Pass
    /// `scanned_low = 0` when the scan reached the boundary or the end of the
    /// stream.
    pub fn advance(&self, max_seen: Option<i64>, scanned_low: i64) -> Checkpoint {
        let mut gaps: Vec<Gap> = self
            .backfill
            .iter()
            .map(|g| Gap {
                floor: g.floor,
                ceiling: g.ceiling.min(scanned_low),
            })
            .collect();

        let last_message_id = match max_seen {
            Some(max) if max > self.last_message_id => {
                gaps.push(Gap {
                    floor: self.last_message_id,
                    ceiling: scanned_low,
                });
                max
            }
            _ => self.last_message_id,
        };

        Checkpoint {
            last_message_id,
            backfill: normalize(gaps),
        }
    }
}

/// Drop empty gaps, sort newest-first and merge overlaps.
fn normalize(mut gaps: Vec<Gap>) -> Vec<Gap> {
    gaps.retain(|g| !g.is_empty());
    gaps.sort_by(|a, b| b.ceiling.cmp(&a.ceiling));

    let mut merged: Vec<Gap> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        match merged.last_mut() {
            Some(prev) if gap.ceiling > prev.floor => {
                prev.floor = prev.floor.min(gap.floor);
            }
            _ => merged.push(gap),
        }
    }
    merged
}

/// On-disk record, keyed by channel username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default)]
    pub channel_username: String,
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Exclusive claim on one channel's checkpoint, released on drop.
pub struct CheckpointLock {
    _guard: Box<dyn Send + Sync>,
}

impl CheckpointLock {
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Durable per-channel progress storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Claim the channel for one run. `None` when another run, possibly in
    /// another process, holds it.
    async fn try_lock(&self, channel: &str) -> std::io::Result<Option<CheckpointLock>>;

    /// Never fails: unreadable state degrades to "no prior progress".
    async fn load(&self, channel: &str) -> Checkpoint;

    /// Atomically replace the channel's checkpoint.
    async fn save(&self, channel: &str, checkpoint: &Checkpoint) -> std::io::Result<()>;

    /// Location of the channel's checkpoint, for error reporting.
    fn location(&self, channel: &str) -> PathBuf;
}

/// One JSON file per channel: `{dir}/{channel}_last_id.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}_last_id.json", channel))
    }

    fn lock_path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", channel))
    }

    async fn read_record(path: &Path) -> anyhow::Result<CheckpointRecord> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every stored checkpoint, sorted by channel.
    pub async fn list(&self) -> anyhow::Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(channel) = name.strip_suffix("_last_id.json") else {
                continue;
            };

            match Self::read_record(&path).await {
                Ok(mut record) => {
                    if record.channel_username.is_empty() {
                        record.channel_username = channel.to_string();
                    }
                    records.push(record);
                }
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.channel_username.cmp(&b.channel_username));
        Ok(records)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn try_lock(&self, channel: &str) -> std::io::Result<Option<CheckpointLock>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path_for(channel);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked {}", path.display());
                Ok(Some(CheckpointLock::new(file)))
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load(&self, channel: &str) -> Checkpoint {
        let path = self.path_for(channel);
        if !path.exists() {
            warn!("No last ID file found for {}. Starting from 0.", channel);
            return Checkpoint::default();
        }

        match Self::read_record(&path).await {
            Ok(record) => record.checkpoint,
            Err(e) => {
                warn!(
                    "Unreadable checkpoint {} ({}). Starting {} from 0.",
                    path.display(),
                    e,
                    channel
                );
                Checkpoint::default()
            }
        }
    }

    async fn save(&self, channel: &str, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let record = CheckpointRecord {
            channel_username: channel.to_string(),
            checkpoint: checkpoint.clone(),
            updated_at: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.path_for(channel), &bytes).await?;
        debug!(
            "Saved last processed ID {} for {}",
            checkpoint.last_message_id, channel
        );
        Ok(())
    }

    fn location(&self, channel: &str) -> PathBuf {
        self.path_for(channel)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write to a sibling temp file, fsync, rename over the destination, then
/// fsync the directory so the rename itself survives a crash.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Unique per writer, also within one process
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(format!(
        ".tmp.{}.{}.{}",
        std::process::id(),
        ts,
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let temp_path = PathBuf::from(temp_path);

    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    #[cfg(unix)]
    {
        let dir = parent.unwrap_or(Path::new("."));
        if let Ok(dir) = tokio::fs::File::open(dir).await {
            if let Err(e) = dir.sync_all().await {
                debug!("Directory fsync failed for {}: {}", path.display(), e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(floor: i64, ceiling: i64) -> Gap {
        Gap { floor, ceiling }
    }

    #[test]
    fn test_resume_from_boundary_keeps_max() {
        let old = Checkpoint {
            last_message_id: 100,
            backfill: vec![],
        };
        // 105..101 processed, then boundary at 100
        let new = old.advance(Some(105), 0);
        assert_eq!(new.last_message_id, 105);
        assert!(new.backfill.is_empty());
    }

    #[test]
    fn test_capped_first_run_leaves_gap() {
        let old = Checkpoint::default();
        // 150..51 processed, cap hit at 51
        let new = old.advance(Some(150), 51);
        assert_eq!(new.last_message_id, 150);
        assert_eq!(new.backfill, vec![gap(0, 51)]);
        assert!(new.is_pending(50));
        assert!(new.is_pending(1));
        assert!(!new.is_pending(51));
        assert!(!new.is_pending(150));
        assert!(new.is_pending(151));
    }

    #[test]
    fn test_backfill_closes_gap_on_exhaustion() {
        let old = Checkpoint {
            last_message_id: 150,
            backfill: vec![gap(0, 51)],
        };
        let new = old.advance(Some(50), 0);
        assert_eq!(new.last_message_id, 150);
        assert!(new.backfill.is_empty());
    }

    #[test]
    fn test_partial_backfill_shrinks_gap() {
        let old = Checkpoint {
            last_message_id: 300,
            backfill: vec![gap(0, 200)],
        };
        // processed 199..120 before cap
        let new = old.advance(Some(199), 120);
        assert_eq!(new.last_message_id, 300);
        assert_eq!(new.backfill, vec![gap(0, 120)]);
    }

    #[test]
    fn test_new_gap_above_existing_gap() {
        let old = Checkpoint {
            last_message_id: 150,
            backfill: vec![gap(0, 51)],
        };
        // 400..301 processed, capped at 301: 151..300 and 1..50 remain
        let new = old.advance(Some(400), 301);
        assert_eq!(new.last_message_id, 400);
        assert_eq!(new.backfill, vec![gap(150, 301), gap(0, 51)]);
        assert!(new.is_pending(200));
        assert!(!new.is_pending(100));
        assert!(new.is_pending(10));
    }

    #[test]
    fn test_adjacent_ids_leave_no_gap() {
        let old = Checkpoint {
            last_message_id: 10,
            backfill: vec![],
        };
        let new = old.advance(Some(20), 11);
        assert!(new.backfill.is_empty());
    }

    #[test]
    fn test_no_messages_keeps_checkpoint() {
        let old = Checkpoint {
            last_message_id: 42,
            backfill: vec![],
        };
        assert_eq!(old.advance(None, 0), old);
    }

    #[test]
    fn test_boundary_respects_lowest_gap() {
        let cp = Checkpoint {
            last_message_id: 150,
            backfill: vec![gap(20, 51)],
        };
        assert!(!cp.is_boundary(100));
        assert!(!cp.is_boundary(30));
        assert!(cp.is_boundary(20));
        assert!(Checkpoint::default().is_boundary(0));
    }

    #[tokio::test]
    async fn test_missing_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.load("abc").await, Checkpoint::default());
    }

    #[tokio::test]
    async fn test_save_then_load_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        let first = Checkpoint {
            last_message_id: 10,
            backfill: vec![gap(0, 5)],
        };
        store.save("abc", &first).await.unwrap();
        let second = Checkpoint {
            last_message_id: 20,
            backfill: vec![],
        };
        store.save("abc", &second).await.unwrap();

        assert_eq!(store.load("abc").await, second);
        // no temp files left behind
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["abc_last_id.json".to_string()]);
    }

    #[tokio::test]
    async fn test_reads_legacy_format() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc_last_id.json"), r#"{"last_id": 77}"#).unwrap();

        let store = FileCheckpointStore::new(dir.path());
        let cp = store.load("abc").await;
        assert_eq!(cp.last_message_id, 77);
        assert!(cp.backfill.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc_last_id.json"), "{not json").unwrap();

        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.load("abc").await, Checkpoint::default());
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_share_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");

        let writes = (0..16).map(|i| {
            let path = path.clone();
            tokio::spawn(async move { write_atomic(&path, format!("{}", i).as_bytes()).await })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.parse::<u32>().unwrap() < 16);
        // only the destination is left in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_write_atomic_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("cp.json");

        write_atomic(&path, b"{}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_channel_lock_is_exclusive_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileCheckpointStore::new(dir.path());
        let second = FileCheckpointStore::new(dir.path());

        let held = first.try_lock("abc").await.unwrap();
        assert!(held.is_some());
        assert!(second.try_lock("abc").await.unwrap().is_none());
        assert!(second.try_lock("xyz").await.unwrap().is_some());

        drop(held);
        assert!(second.try_lock("abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_ignores_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let _lock = store.try_lock("abc").await.unwrap();
        store
            .save("abc", &Checkpoint { last_message_id: 3, backfill: vec![] })
            .await
            .unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checkpoint.last_message_id, 3);
    }

    #[tokio::test]
    async fn test_list_returns_all_channels() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store
            .save("zeta", &Checkpoint { last_message_id: 2, backfill: vec![] })
            .await
            .unwrap();
        store
            .save("alpha", &Checkpoint { last_message_id: 1, backfill: vec![] })
            .await
            .unwrap();
        std::fs::write(dir.path().join("last_run.json"), "{}").unwrap();

        let records = store.list().await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.channel_username.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
