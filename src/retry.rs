use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::SourceError;

/// Bounded retry with exponential backoff for calls to the message source.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped at 30s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(Duration::from_secs(30))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        match self.attempt(what, None, op).await {
            Some(result) => result,
            None => Err(SourceError::Unavailable(format!("{} cancelled", what))),
        }
    }

    /// Like `run`, but gives up as soon as `cancel` fires, including while
    /// waiting between attempts. `None` means cancelled.
    pub async fn run_until_cancelled<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Option<Result<T, SourceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.attempt(what, Some(cancel), op).await
    }

    async fn attempt<T, F, Fut>(
        &self,
        what: &str,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Option<Result<T, SourceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    result = op() => result,
                },
                None => op().await,
            };

            match result {
                Ok(value) => return Some(Ok(value)),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    match cancel {
                        Some(cancel) => tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return None,
                            _ = tokio::time::sleep(delay) => {}
                        },
                        None => tokio::time::sleep(delay).await,
                    }
                    attempt += 1;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
        )
    }
}
