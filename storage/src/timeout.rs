use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage_driver::{StorageError, StorageErrorKind};

/// Per-operation time limits for backend calls, in seconds.
///
/// When a limit is reached the in-flight future is dropped, which cancels the
/// underlying network or disk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Timeouts {
    /// Whole-object uploads, downloads and single parts.
    pub transfer_secs: u64,

    /// Multipart completion and abort.
    pub complete_secs: u64,

    /// Metadata, progress, listing, deletion and presigning.
    pub metadata_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transfer_secs: 20 * 60,
            complete_secs: 10 * 60,
            metadata_secs: 5 * 60,
        }
    }
}

impl Timeouts {
    /// Limit for uploads, downloads and parts.
    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    /// Limit for multipart completion and abort.
    pub fn complete(&self) -> Duration {
        Duration::from_secs(self.complete_secs)
    }

    /// Limit for metadata-style calls.
    pub fn metadata(&self) -> Duration {
        Duration::from_secs(self.metadata_secs)
    }
}

/// Run `future` with a time limit, reporting expiry as a `Timeout` storage error.
pub(crate) async fn bounded<T, F>(
    engine: &'static str,
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(elapsed) => {
            tracing::warn!(engine, operation, ?limit, "storage operation timed out");
            Err(
                StorageError::builder(engine, StorageErrorKind::Timeout, elapsed)
                    .context(format!("{engine}: {operation}"))
                    .build(),
            )
        }
    }
}
