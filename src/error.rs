use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a message source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Network or authentication failure reaching the source.
    #[error("message source unavailable: {0}")]
    Unavailable(String),

    /// The channel is unknown or was deleted upstream.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The source answered with something we could not interpret.
    #[error("unexpected response from message source: {0}")]
    Protocol(String),
}

impl SourceError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Terminal failure of one channel's run. Never aborts the other channels.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("source unavailable for {channel}: {source}")]
    SourceUnavailable {
        channel: String,
        #[source]
        source: SourceError,
    },

    #[error("could not resolve channel {channel}: {reason}")]
    ChannelResolutionFailed { channel: String, reason: String },

    #[error("failed to write checkpoint for {channel} at {}: {source}", .path.display())]
    CheckpointWriteFailed {
        channel: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock checkpoint for {channel} at {}: {source}", .path.display())]
    CheckpointLockFailed {
        channel: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage sink rejected message {message_id} of {channel}: {reason}")]
    SinkWriteFailed {
        channel: String,
        message_id: i64,
        reason: String,
    },

    #[error("{channel} delivered message {current} after {previous}, expected strictly decreasing ids")]
    OutOfOrder {
        channel: String,
        previous: i64,
        current: i64,
    },

    #[error("another ingestion of {0} is already in progress")]
    AlreadyRunning(String),
}

impl ChannelError {
    /// Wrap a source error raised while talking to `channel`.
    pub fn from_source(channel: &str, err: SourceError) -> Self {
        match err {
            SourceError::ChannelNotFound(reason) => ChannelError::ChannelResolutionFailed {
                channel: channel.to_string(),
                reason,
            },
            other => ChannelError::SourceUnavailable {
                channel: channel.to_string(),
                source: other,
            },
        }
    }
}

/// Failure to store one message's media. Logged and counted, never propagated.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("download failed: {0}")]
    Download(#[from] SourceError),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
