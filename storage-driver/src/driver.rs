use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::Uri;
use sha2::Digest as _;
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Backend-specific locator for stored content.
///
/// For key/value style backends this is the object key; content-addressed
/// backends (IPFS) return the content identifier instead. Whatever was returned
/// from an upload is what must be handed back to download, metadata and delete.
pub type StorageLink = Utf8PathBuf;

/// The part-number ceiling used when a backend does not configure its own.
///
/// Matches the S3 limit.
pub const DEFAULT_MAX_PARTS: u32 = 10_000;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// Opaque identifier of an in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(Arc<str>);

impl UploadId {
    /// Generate a fresh, random upload id.
    pub fn new_v4() -> Self {
        UploadId(uuid::Uuid::new_v4().to_string().into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UploadId {
    fn from(value: String) -> Self {
        UploadId(value.into())
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        UploadId(value.into())
    }
}

/// A finalized part of a multipart upload.
///
/// Parts are concatenated in ascending `part_number` order on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,

    /// Backend-assigned entity tag for this part.
    pub etag: String,

    /// Hex encoded SHA-256 of the part contents.
    pub checksum: String,

    /// Number of bytes in this part.
    pub size: u64,
}

impl CompletedPart {
    /// Record a part for `content`, computing its checksum. The checksum doubles
    /// as the etag for backends which do not assign their own.
    pub fn for_content(part_number: u32, content: &[u8]) -> Self {
        let checksum = hex::encode(sha2::Sha256::digest(content));
        Self {
            part_number,
            etag: checksum.clone(),
            checksum,
            size: content.len() as u64,
        }
    }

    /// Replace the etag with the one assigned by the backend.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }
}

/// Progress of an in-flight multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadProgress {
    /// Bytes received so far, across all parts.
    pub size: u64,

    /// Number of parts received so far.
    pub parts: u32,
}

/// Check that `part_number` is the next part of an upload which has already
/// received `received` parts, and that it does not exceed `max_parts`.
pub fn check_part_number(
    engine: &'static str,
    received: u32,
    part_number: u32,
    max_parts: u32,
) -> Result<(), StorageError> {
    if part_number > max_parts {
        return Err(StorageError::builder(
            engine,
            StorageErrorKind::TooManyParts,
            format!("part {part_number} exceeds the maximum of {max_parts} parts"),
        )
        .build());
    }

    if part_number != received + 1 {
        return Err(StorageError::builder(
            engine,
            StorageErrorKind::InvalidRequest,
            format!(
                "part {part_number} is out of sequence, expected part {}",
                received + 1
            ),
        )
        .build());
    }

    Ok(())
}

/// Check that `parts` are numbered `1..=n` in ascending order with no gaps.
pub fn check_part_sequence(
    engine: &'static str,
    parts: &[CompletedPart],
) -> Result<(), StorageError> {
    for (index, part) in parts.iter().enumerate() {
        let expected = index as u32 + 1;
        if part.part_number != expected {
            return Err(StorageError::builder(
                engine,
                StorageErrorKind::InvalidRequest,
                format!(
                    "completed parts are not contiguous: found part {} at position {expected}",
                    part.part_number
                ),
            )
            .build());
        }
    }
    Ok(())
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Every registry backend implements this one capability set. Backends without
/// native multipart support buffer parts and complete them with a single atomic
/// upload; the observable effect (ascending-order concatenation, atomic
/// completion) is the same for all of them.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme of the driver.
    fn scheme(&self) -> &str;

    /// The highest part number accepted by [`Driver::upload_part`].
    fn max_parts(&self) -> u32 {
        DEFAULT_MAX_PARTS
    }

    /// Delete a file from the storage, by link.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for a file, by link.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload a file to the storage, using a reader stream to provide the contents.
    ///
    /// Returns the link under which the content is immediately readable.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the files in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Open a multipart upload which will land at `remote` once completed.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError>;

    /// Upload one part. Part numbers start at 1 and must be strictly sequential.
    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError>;

    /// Concatenate `parts` in ascending part-number order and store the result atomically.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError>;

    /// Discard a multipart upload. Aborting an unknown upload is not an error.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError>;

    /// Report how much of a multipart upload has been received.
    async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError>;

    /// Mark an open multipart upload as active, pushing back its expiry.
    ///
    /// Drivers which do not track upload lifetimes accept any id.
    async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        let _ = (bucket, remote, upload_id);
        Ok(())
    }

    /// Set how long a multipart upload may sit idle before
    /// [`Driver::reap_expired_uploads`] reclaims it.
    fn set_upload_ttl(&self, ttl: Duration) {
        let _ = ttl;
    }

    /// Abort multipart uploads which have been idle longer than the driver's
    /// session TTL, returning how many were reclaimed.
    async fn reap_expired_uploads(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    /// Generate a short-lived, read-only URL for a stored object.
    async fn presigned_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let _ = expires_in;
        Err(StorageError::builder(
            self.name(),
            StorageErrorKind::Unsupported,
            "presigned urls are not supported by this driver",
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn part_sequence() {
        let parts: Vec<_> = (1..=3)
            .map(|n| CompletedPart::for_content(n, b"abc"))
            .collect();
        assert!(check_part_sequence("test", &parts).is_ok());

        let gap = vec![parts[0].clone(), parts[2].clone()];
        assert!(check_part_sequence("test", &gap).is_err());
    }

    #[test]
    fn part_number_ceiling() {
        let err = check_part_number("test", 4, 5, 4).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::TooManyParts);

        let err = check_part_number("test", 1, 3, 10).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);

        assert!(check_part_number("test", 0, 1, 10).is_ok());
    }

    #[test]
    fn completed_part_checksum() {
        let part = CompletedPart::for_content(1, b"AAAA");
        assert_eq!(part.size, 4);
        assert_eq!(part.checksum.len(), 64);
        assert_eq!(part.etag, part.checksum);
        assert_eq!(part.with_etag("\"etag\"").etag, "\"etag\"");
    }
}
