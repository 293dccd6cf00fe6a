use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage_driver::{StorageError, StorageErrorKind};

/// A bounded, fixed-delay retry policy for storage lookups.
///
/// Some backends (IPFS in particular) index new content asynchronously, so a
/// metadata lookup immediately after an upload may briefly report the object as
/// missing. Lookups are retried on `NotFound` and on retryable kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,

    /// Delay between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// A policy which makes exactly one attempt.
    pub fn never() -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
        }
    }

    /// The delay between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    fn should_retry(&self, attempt: u32, error: &StorageError) -> bool {
        attempt < self.attempts
            && (error.kind() == StorageErrorKind::NotFound || error.is_retryable())
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(attempt, &error) => {
                    tracing::warn!(attempt, attempts = self.attempts, "retrying: {error}");
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
