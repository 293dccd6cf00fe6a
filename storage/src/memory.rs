use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};

use storage_driver::{
    CompletedPart, Driver, Metadata, Reader, StorageError, StorageErrorKind, StorageLink,
    UploadId, UploadProgress, Writer,
};

use crate::buffered::MultipartBuffer;
use crate::io_error_to_storage;
use crate::session::DEFAULT_SESSION_TTL;

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryFileItem {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Buckets = HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>;

/// Storage driver that stores files in memory.
///
/// Intended as a test double and for single-process deployments; multipart
/// uploads are buffered in memory until completion.
#[derive(Debug)]
pub struct MemoryStorage {
    buckets: RwLock<Buckets>,
    multipart: MultipartBuffer,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            buckets: RwLock::default(),
            multipart: MultipartBuffer::new("memory", DEFAULT_SESSION_TTL),
        }
    }
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
            ..Default::default()
        }
    }

    /// Set the inactivity timeout for multipart uploads.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.multipart = MultipartBuffer::new("memory", ttl);
        self
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    fn bucket_not_found(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }

    async fn store(&self, bucket: &str, remote: &Utf8Path, data: Bytes) {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), data.into());
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    fn max_parts(&self) -> u32 {
        self.multipart.max_parts()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        bucket_map
            .remove(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?;

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError> {
        let mut buf = Vec::new();

        local
            .read_to_end(&mut buf)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        self.store(bucket, remote, buf.into()).await;
        Ok(remote.to_owned())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets
                .get(bucket)
                .ok_or_else(|| self.bucket_not_found(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
                .data
                .clone()
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;

        let mut paths = Vec::new();
        for path in bucket_map.keys() {
            if let Some(prefix) = prefix {
                if path.starts_with(prefix) {
                    paths.push(path.to_string());
                }
            } else {
                paths.push(path.to_string());
            }
        }
        paths.sort();

        Ok(paths)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        Ok(self.multipart.create(bucket, remote))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.multipart
            .append(bucket, remote, upload_id, part_number, content)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        let content = self.multipart.assemble(bucket, remote, upload_id, parts)?;
        self.store(bucket, remote, content).await;
        self.multipart.finish(upload_id);
        Ok(remote.to_owned())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.multipart.abort(upload_id);
        Ok(())
    }

    async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.multipart.progress(bucket, remote, upload_id)
    }

    async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.multipart.touch(bucket, remote, upload_id)
    }

    fn set_upload_ttl(&self, ttl: Duration) {
        self.multipart.set_ttl(ttl);
    }

    async fn reap_expired_uploads(&self) -> Result<usize, StorageError> {
        Ok(self.multipart.reap_expired())
    }
}
