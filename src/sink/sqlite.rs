use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{NormalizedRecord, RecordSink, UpsertOutcome};

/// Thread-safe SQLite store for ingested messages
#[derive(Clone)]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Message store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS telegram_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_title TEXT NOT NULL,
                channel_username TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                message TEXT,
                message_date TEXT,
                media_path TEXT,
                emoji_used TEXT,
                external_links TEXT,
                ingested_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (channel_username, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_telegram_messages_date
                ON telegram_messages(channel_username, message_date);
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }

    /// Stored records for a channel, newest first
    #[cfg(test)]
    pub async fn records(&self, channel_username: &str) -> Result<Vec<NormalizedRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT channel_title, channel_username, message_id, message, message_date,
                    media_path, emoji_used, external_links
             FROM telegram_messages
             WHERE channel_username = ?1
             ORDER BY message_id DESC",
        )?;

        let records = stmt
            .query_map(rusqlite::params![channel_username], |row| {
                let date: String = row.get(4)?;
                let message_timestamp = chrono::DateTime::parse_from_rfc3339(&date)
                    .map(|d| d.with_timezone(&chrono::Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                let media_path: Option<String> = row.get(5)?;
                Ok(NormalizedRecord {
                    channel_title: row.get(0)?,
                    channel_username: row.get(1)?,
                    message_id: row.get(2)?,
                    message_text: row.get(3)?,
                    message_timestamp,
                    media_path: media_path.map(std::path::PathBuf::from),
                    emoji_used: row.get(6)?,
                    external_links: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load records")?;

        Ok(records)
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertOutcome> {
        let conn = self.conn.lock().await;
        let media_path = record
            .media_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let changed = conn
            .execute(
                "INSERT INTO telegram_messages
                 (channel_title, channel_username, message_id, message, message_date,
                  media_path, emoji_used, external_links)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (channel_username, message_id) DO NOTHING",
                rusqlite::params![
                    &record.channel_title,
                    &record.channel_username,
                    record.message_id,
                    &record.message_text,
                    record.message_timestamp.to_rfc3339(),
                    media_path,
                    &record.emoji_used,
                    &record.external_links,
                ],
            )
            .with_context(|| format!("Failed to insert message {}", record.message_id))?;

        Ok(if changed == 0 {
            UpsertOutcome::Duplicate
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn count(&self, channel_username: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM telegram_messages WHERE channel_username = ?1",
                rusqlite::params![channel_username],
                |row| row.get(0),
            )
            .context("Failed to count messages")?;
        Ok(count as usize)
    }
}
