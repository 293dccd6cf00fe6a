//! # Storage backends
//!
//! Configuration and unification for the storage backends which hold registry
//! content: an in-memory store, the local filesystem, S3-compatible object
//! stores (feature `s3`) and IPFS nodes (feature `ipfs`).
//!
//! Every backend implements [`storage_driver::Driver`]. The [`Storage`] handle
//! wraps a driver with tracing, per-operation [`Timeouts`] and a bounded
//! [`RetryPolicy`] for metadata lookups, and can run the multipart garbage
//! collector with [`Storage::spawn_gc`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use http::Uri;
use serde::Deserialize;
use tokio::io;

mod buffered;
#[cfg(feature = "ipfs")]
pub(crate) mod ipfs;
#[cfg(feature = "local")]
pub(crate) mod local;
pub(crate) mod memory;
mod retry;
#[cfg(feature = "s3")]
pub(crate) mod s3;
pub mod session;
mod timeout;

#[cfg(feature = "ipfs")]
#[doc(inline)]
pub use ipfs::{IpfsConfig, IpfsDriver};
#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;
#[doc(inline)]
pub use memory::MemoryStorage;
pub use retry::RetryPolicy;
#[cfg(feature = "s3")]
#[doc(inline)]
pub use s3::{S3Config, S3Driver, DEFAULT_MIN_PART_SIZE};
pub use session::{GcHandle, SessionManager, DEFAULT_GC_INTERVAL, DEFAULT_SESSION_TTL};
pub use timeout::Timeouts;

#[doc(inline)]
pub use storage_driver::{
    CompletedPart, Driver, Metadata, Reader, StorageError, StorageErrorKind, StorageLink,
    UploadId, UploadProgress, Writer,
};

use timeout::bounded;

pub(crate) fn io_error_kind(error: &std::io::Error) -> StorageErrorKind {
    match error.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        std::io::ErrorKind::TimedOut => StorageErrorKind::Timeout,
        std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
        _ => StorageErrorKind::Io,
    }
}

/// Convert an I/O error into a storage error, preserving the semantic kind.
pub(crate) fn io_error_to_storage(engine: &'static str, error: std::io::Error) -> StorageError {
    StorageError::new(engine, io_error_kind(&error), error)
}

/// Backend selection, as read from the server configuration file.
///
/// The bucket itself is chosen by the registry, not by the backend section.
///
/// ```toml
/// [storage.s3]
/// endpoint = "http://localhost:9000"
/// region = "us-east-1"
/// access-key-id = "minio"
/// secret-access-key = "minio123"
/// min-part-size = 5242880
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Volatile in-process storage.
    Memory {},

    /// Files below a root directory.
    #[cfg(feature = "local")]
    Local {
        /// Root directory, created on demand.
        path: Utf8PathBuf,
    },

    /// An S3-compatible object store.
    #[cfg(feature = "s3")]
    S3(S3Config),

    /// A Kubo (go-ipfs) node reached over its RPC API.
    #[cfg(feature = "ipfs")]
    Ipfs(IpfsConfig),
}

impl StorageConfig {
    /// Construct the configured backend, which will hold its content in
    /// `bucket`. Volatile storage creates the bucket up front.
    #[tracing::instrument]
    pub async fn build(self, bucket: &str) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory {} => MemoryStorage::with_buckets(&[bucket]).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "s3")]
            StorageConfig::S3(config) => S3Driver::new(config).into(),
            #[cfg(feature = "ipfs")]
            StorageConfig::Ipfs(config) => IpfsDriver::connect(config).await?.into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
    retry: RetryPolicy,
    timeouts: Timeouts,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver with the default retry policy and timeouts.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
        }
    }

    /// Replace the metadata retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the per-operation timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The driver name.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The highest part number the driver accepts.
    pub fn max_parts(&self) -> u32 {
        self.driver.max_parts()
    }

    /// The metadata retry policy.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The per-operation timeouts.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// A handle bound to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            storage: self.clone(),
            bucket: bucket.into(),
        }
    }

    /// Object metadata, retried according to the [`RetryPolicy`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.retry
            .run(|| {
                bounded(
                    self.name(),
                    "metadata",
                    self.timeouts.metadata(),
                    self.driver.metadata(bucket, remote),
                )
            })
            .await
    }

    /// Stream an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        bounded(
            self.name(),
            "download",
            self.timeouts.transfer(),
            self.driver.download(bucket, remote, writer),
        )
        .await
    }

    /// Read an entire object into memory.
    pub async fn download_bytes(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Bytes, StorageError> {
        let mut buffer = Vec::new();
        self.download(bucket, remote, &mut buffer).await?;
        Ok(buffer.into())
    }

    /// Store an object atomically, returning its link.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<StorageLink, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        bounded(
            self.name(),
            "upload",
            self.timeouts.transfer(),
            self.driver.upload(bucket, remote, reader),
        )
        .await
    }

    /// Store an in-memory object atomically, returning its link.
    pub async fn upload_bytes(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: &[u8],
    ) -> Result<StorageLink, StorageError> {
        let mut reader = content;
        self.upload(bucket, remote, &mut reader).await
    }

    /// List objects under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        bounded(
            self.name(),
            "list",
            self.timeouts.metadata(),
            self.driver.list(bucket, prefix),
        )
        .await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        bounded(
            self.name(),
            "delete",
            self.timeouts.metadata(),
            self.driver.delete(bucket, path),
        )
        .await
    }

    /// Open a multipart upload targeting `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        bounded(
            self.name(),
            "create multipart upload",
            self.timeouts.metadata(),
            self.driver.create_multipart_upload(bucket, remote),
        )
        .await
    }

    /// Upload the next part of a multipart upload.
    #[tracing::instrument(skip(self, content), fields(driver=self.driver.name(), size=content.len()))]
    pub async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        bounded(
            self.name(),
            "upload part",
            self.timeouts.transfer(),
            self.driver
                .upload_part(bucket, remote, upload_id, part_number, content),
        )
        .await
    }

    /// Complete a multipart upload.
    #[tracing::instrument(skip(self, parts), fields(driver=self.driver.name(), parts=parts.len()))]
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        bounded(
            self.name(),
            "complete multipart upload",
            self.timeouts.complete(),
            self.driver
                .complete_multipart_upload(bucket, remote, upload_id, parts),
        )
        .await
    }

    /// Abort a multipart upload. Unknown uploads are ignored.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        bounded(
            self.name(),
            "abort multipart upload",
            self.timeouts.complete(),
            self.driver.abort_multipart_upload(bucket, remote, upload_id),
        )
        .await
    }

    /// How much of a multipart upload has been received.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        bounded(
            self.name(),
            "upload progress",
            self.timeouts.metadata(),
            self.driver.upload_progress(bucket, remote, upload_id),
        )
        .await
    }

    /// A short-lived, read-only URL for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn presigned_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        bounded(
            self.name(),
            "presign",
            self.timeouts.metadata(),
            self.driver.presigned_url(bucket, remote, expires_in),
        )
        .await
    }

    /// Push back the expiry of an open multipart upload.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        bounded(
            self.name(),
            "touch multipart upload",
            self.timeouts.metadata(),
            self.driver.touch_multipart_upload(bucket, remote, upload_id),
        )
        .await
    }

    /// Set how long multipart uploads may sit idle before garbage collection
    /// reclaims them.
    pub fn set_upload_ttl(&self, ttl: Duration) {
        tracing::debug!(driver = self.name(), ?ttl, "multipart upload ttl");
        self.driver.set_upload_ttl(ttl);
    }

    /// Run one multipart garbage collection sweep.
    pub async fn reap_expired_uploads(&self) -> Result<usize, StorageError> {
        bounded(
            self.name(),
            "reap expired uploads",
            self.timeouts.complete(),
            self.driver.reap_expired_uploads(),
        )
        .await
    }

    /// Periodically reclaim abandoned multipart uploads in the background.
    pub fn spawn_gc(&self, interval: Duration) -> GcHandle {
        let storage = self.clone();
        GcHandle::spawn(interval, move || {
            let storage = storage.clone();
            async move {
                match storage.reap_expired_uploads().await {
                    Ok(0) => {}
                    Ok(reaped) => {
                        tracing::debug!(driver = storage.name(), reaped, "reaped multipart uploads")
                    }
                    Err(error) => tracing::warn!("multipart gc failed: {error}"),
                }
            }
        })
    }
}

/// A [`Storage`] handle bound to a single bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket name.
    pub bucket: String,
    storage: Storage,
}

impl StorageBucket {
    /// The underlying storage handle.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The driver name.
    pub fn name(&self) -> &'static str {
        self.storage.name()
    }

    /// Object metadata, retried according to the [`RetryPolicy`].
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.storage.metadata(&self.bucket, remote).await
    }

    /// Stream an object into `writer`.
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        self.storage.download(&self.bucket, remote, writer).await
    }

    /// Read an entire object into memory.
    pub async fn download_bytes(&self, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.storage.download_bytes(&self.bucket, remote).await
    }

    /// Store an object atomically, returning its link.
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<StorageLink, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        self.storage.upload(&self.bucket, remote, reader).await
    }

    /// Store an in-memory object atomically, returning its link.
    pub async fn upload_bytes(
        &self,
        remote: &Utf8Path,
        content: &[u8],
    ) -> Result<StorageLink, StorageError> {
        self.storage.upload_bytes(&self.bucket, remote, content).await
    }

    /// List objects under a prefix.
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.storage.list(&self.bucket, prefix).await
    }

    /// Delete an object.
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.storage.delete(&self.bucket, path).await
    }

    /// Open a multipart upload targeting `remote`.
    pub async fn create_multipart_upload(
        &self,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.storage
            .create_multipart_upload(&self.bucket, remote)
            .await
    }

    /// Upload the next part of a multipart upload.
    pub async fn upload_part(
        &self,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.storage
            .upload_part(&self.bucket, remote, upload_id, part_number, content)
            .await
    }

    /// Complete a multipart upload.
    pub async fn complete_multipart_upload(
        &self,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        self.storage
            .complete_multipart_upload(&self.bucket, remote, upload_id, parts)
            .await
    }

    /// Abort a multipart upload. Unknown uploads are ignored.
    pub async fn abort_multipart_upload(
        &self,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.storage
            .abort_multipart_upload(&self.bucket, remote, upload_id)
            .await
    }

    /// How much of a multipart upload has been received.
    pub async fn upload_progress(
        &self,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.storage
            .upload_progress(&self.bucket, remote, upload_id)
            .await
    }

    /// Push back the expiry of an open multipart upload.
    pub async fn touch_multipart_upload(
        &self,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.storage
            .touch_multipart_upload(&self.bucket, remote, upload_id)
            .await
    }

    /// A short-lived, read-only URL for an object.
    pub async fn presigned_url(
        &self,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        self.storage
            .presigned_url(&self.bucket, remote, expires_in)
            .await
    }
}
