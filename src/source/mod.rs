pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

pub use http::HttpSource;

/// Media attached to a message, modelled as an explicit tagged variant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaDescriptor {
    #[default]
    None,
    Photo,
    Document { mime_type: String },
}

impl MediaDescriptor {
    pub fn is_none(&self) -> bool {
        matches!(self, MediaDescriptor::None)
    }
}

/// A message as delivered by the source. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "media_or_none")]
    pub media: MediaDescriptor,
}

/// Accept `"media": null` as well as a missing field.
fn media_or_none<'de, D>(deserializer: D) -> Result<MediaDescriptor, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<MediaDescriptor>::deserialize(deserializer)?.unwrap_or_default())
}

/// Display metadata resolved from the source at the start of a channel run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    pub title: String,
}

/// Lazy, finite, newest-first message sequence. Not restartable.
pub type MessageStream<'a> = BoxStream<'a, Result<Message, SourceError>>;

/// Capability to read an external message feed.
///
/// Implementations own the wire protocol (authentication, pagination).
/// The ingestion core only relies on the ordering contract of `messages`:
/// ids are yielded in strictly decreasing order.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn resolve(&self, username: &str) -> Result<ChannelInfo, SourceError>;

    fn messages<'a>(&'a self, username: &'a str) -> MessageStream<'a>;

    async fn download_media(&self, username: &str, message: &Message)
        -> Result<Vec<u8>, SourceError>;
}
