use anyhow::{Context, Result};
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::coordinator::RunSummary;

/// Telegram caps messages at 4096 characters; keep a margin.
const MAX_CHUNK: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Sends run summaries to an operator chat through a Telegram bot.
pub struct Notifier {
    bot: Bot,
    chat_id: ChatId,
    only_on_failure: bool,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            chat_id: ChatId(config.chat_id),
            only_on_failure: config.only_on_failure,
        }
    }

    pub fn should_send(&self, summary: &RunSummary) -> bool {
        !self.only_on_failure || summary.has_failures()
    }

    pub async fn send_summary(&self, summary: &RunSummary) -> Result<()> {
        if !self.should_send(summary) {
            return Ok(());
        }

        for chunk in split_message(&summary.render(), MAX_CHUNK) {
            self.bot
                .send_message(self.chat_id, chunk)
                .await
                .context("Failed to send run summary")?;
        }
        info!("Run summary sent to chat {}", self.chat_id.0);
        Ok(())
    }

    /// Like `send_summary`, but only logs failures.
    pub async fn try_send_summary(&self, summary: &RunSummary) {
        if let Err(e) = self.send_summary(summary).await {
            warn!("{:#}", e);
        }
    }
}
