use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Channel usernames, in processing order.
    #[serde(default)]
    pub channels: Vec<String>,
    /// JSON file of the form `{"channels": [...]}`, read on every run.
    #[serde(default)]
    pub channels_file: Option<PathBuf>,
    pub source: SourceConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default = "default_ingest_config")]
    pub ingest: IngestConfig,
    #[serde(default = "default_retry_config")]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Checkpoint files and the last run summary live here.
    #[serde(default = "default_raw_data_dir")]
    pub raw_data_dir: PathBuf,
    /// Flat directory for downloaded media. Defaults to `{raw_data_dir}/photos`.
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub sink: SinkKind,
    /// CSV export file. Defaults to `{raw_data_dir}/scraped_data.csv`.
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

/// Where normalized records are written.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Sqlite,
    Csv,
    Both,
}

impl StorageConfig {
    pub fn content_dir(&self) -> PathBuf {
        self.content_dir
            .clone()
            .unwrap_or_else(|| self.raw_data_dir.join("photos"))
    }

    pub fn csv_path(&self) -> PathBuf {
        self.csv_path
            .clone()
            .unwrap_or_else(|| self.raw_data_dir.join("scraped_data.csv"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_messages_per_run")]
    pub max_messages_per_run: usize,
    /// Channels ingested at the same time. 1 means sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Six-field cron expression (with seconds), e.g. "0 0 * * * *".
    pub cron: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily-rotated file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    pub bot_token: String,
    pub chat_id: i64,
    /// Only send a summary when at least one channel failed.
    #[serde(default)]
    pub only_on_failure: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    #[serde(default)]
    channels: Vec<String>,
}

fn default_page_size() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_raw_data_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("telegram.db")
}

fn default_max_messages_per_run() -> usize {
    100
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_log_file_prefix() -> String {
    "scraping.log".to_string()
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        raw_data_dir: default_raw_data_dir(),
        content_dir: None,
        database_path: default_db_path(),
        sink: SinkKind::default(),
        csv_path: None,
    }
}

fn default_ingest_config() -> IngestConfig {
    IngestConfig {
        max_messages_per_run: default_max_messages_per_run(),
        concurrency: default_concurrency(),
    }
}

fn default_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: default_max_attempts(),
        base_delay_ms: default_base_delay_ms(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)?;

        for dir in [config.storage.raw_data_dir.clone(), config.storage.content_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.ingest.max_messages_per_run == 0 {
            anyhow::bail!("ingest.max_messages_per_run must be at least 1");
        }
        if config.ingest.concurrency == 0 {
            anyhow::bail!("ingest.concurrency must be at least 1");
        }
        if config.source.page_size == 0 {
            anyhow::bail!("source.page_size must be at least 1");
        }
        if config.channels.is_empty() && config.channels_file.is_none() {
            anyhow::bail!("no channels configured: set `channels` or `channels_file`");
        }

        Ok(config)
    }

    /// The channel list for one run: inline channels followed by those of
    /// `channels_file`, duplicates removed, order preserved.
    pub fn load_channels(&self) -> Result<Vec<String>> {
        let mut channels = self.channels.clone();

        if let Some(path) = &self.channels_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Channels file {} not found", path.display()))?;
            let file: ChannelsFile = serde_json::from_str(&content)
                .with_context(|| format!("Error decoding JSON file {}", path.display()))?;
            channels.extend(file.channels);
        }

        let mut seen = std::collections::HashSet::new();
        Ok(channels
            .into_iter()
            .map(|c| c.trim().trim_start_matches('@').to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect())
    }
}
