use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{ChannelInfo, Message, MessageSource, MessageStream};
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<Message>,
}

/// Message source backed by a JSON gateway in front of the feed network.
///
/// ```text
/// GET /channels/{username}                           -> {"title": ...}
/// GET /channels/{username}/messages?limit&offset_id  -> {"messages": [...]}, newest first
/// GET /channels/{username}/messages/{id}/media       -> raw bytes
/// ```
pub struct HttpSource {
    client: reqwest::Client,
    config: SourceConfig,
    retry: RetryPolicy,
}

impl HttpSource {
    pub fn new(config: SourceConfig, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, SourceError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = self.config.api_token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        debug!("GET {}", url);
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => SourceError::ChannelNotFound(format!("{} ({})", url, body)),
            s if s.is_server_error()
                || s == StatusCode::TOO_MANY_REQUESTS
                || s == StatusCode::UNAUTHORIZED
                || s == StatusCode::FORBIDDEN
                || s == StatusCode::REQUEST_TIMEOUT =>
            {
                SourceError::Unavailable(format!("{} returned {}: {}", url, s, body))
            }
            s => SourceError::Protocol(format!("{} returned {}: {}", url, s, body)),
        })
    }

    async fn fetch_page(
        &self,
        username: &str,
        offset_id: Option<i64>,
    ) -> Result<Vec<Message>, SourceError> {
        let url = self.url(&format!("/channels/{}/messages", username));
        let mut query = vec![("limit", self.config.page_size.to_string())];
        if let Some(offset) = offset_id {
            query.push(("offset_id", offset.to_string()));
        }

        let page: MessagePage = self
            .get(&url, &query)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Protocol(format!("invalid message page: {}", e)))?;
        Ok(page.messages)
    }

    /// Pagination step. `cursor` is `None` once the last page was seen,
    /// otherwise the offset of the next page (`Some(None)` for the first).
    async fn next_page(
        &self,
        username: &str,
        cursor: Option<Option<i64>>,
    ) -> Result<Option<(Vec<Message>, Option<Option<i64>>)>, SourceError> {
        let Some(offset) = cursor else {
            return Ok(None);
        };

        let what = format!("message page of {}", username);
        let page = self
            .retry
            .run(&what, || self.fetch_page(username, offset))
            .await?;
        if page.is_empty() {
            return Ok(None);
        }

        let next = if page.len() < self.config.page_size {
            None
        } else {
            page.last().map(|m| Some(m.id))
        };
        Ok(Some((page, next)))
    }
}

#[async_trait]
impl MessageSource for HttpSource {
    async fn resolve(&self, username: &str) -> Result<ChannelInfo, SourceError> {
        let url = self.url(&format!("/channels/{}", username));
        self.get(&url, &[])
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Protocol(format!("invalid channel info: {}", e)))
    }

    fn messages<'a>(&'a self, username: &'a str) -> MessageStream<'a> {
        futures::stream::try_unfold(Some(None), move |cursor| self.next_page(username, cursor))
            .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok::<Message, SourceError>)))
            .try_flatten()
            .boxed()
    }

    async fn download_media(
        &self,
        username: &str,
        message: &Message,
    ) -> Result<Vec<u8>, SourceError> {
        let url = self.url(&format!("/channels/{}/messages/{}/media", username, message.id));
        let bytes = self
            .get(&url, &[])
            .await?
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}
