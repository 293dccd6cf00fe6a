//! S3-compatible object storage, using the native multipart upload API.
//!
//! S3 rejects any part but the last below 5 MiB, while registry clients push
//! chunks of whatever size suits them. The driver therefore accumulates
//! incoming parts and only sends an S3 part once `min-part-size` bytes are
//! pending. An upload which never reaches that size is stored with a single
//! `PutObject` on completion.

use std::time::Duration;

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::Uri;
use secret::Secret;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use storage_driver::{
    check_part_number, check_part_sequence, CompletedPart, Driver, Metadata, Reader,
    StorageError, StorageErrorKind, StorageLink, UploadId, UploadProgress, Writer,
    DEFAULT_MAX_PARTS,
};

use crate::io_error_to_storage;
use crate::session::{SessionManager, DEFAULT_SESSION_TTL};

const ENGINE: &str = "s3";

fn default_max_parts() -> u32 {
    DEFAULT_MAX_PARTS
}

fn default_path_style() -> bool {
    true
}

/// Smallest part S3 accepts for anything but the final part.
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

fn default_min_part_size() -> u64 {
    DEFAULT_MIN_PART_SIZE
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
    /// Custom endpoint (MinIO, Ceph, R2 ...). Uses AWS when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Signing region.
    pub region: String,

    /// Access key id.
    pub access_key_id: String,

    /// Secret access key.
    pub secret_access_key: Secret,

    /// Highest accepted part number.
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Address buckets as `<endpoint>/<bucket>` rather than by subdomain.
    #[serde(default = "default_path_style")]
    pub force_path_style: bool,

    /// Bytes accumulated before an S3 part is sent.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct S3Upload {
    bucket: String,
    key: Utf8PathBuf,
}

#[derive(Debug, Clone)]
struct SentPart {
    number: i32,
    etag: String,
}

/// Parts received from the caller and how they were forwarded to S3.
#[derive(Debug, Default)]
struct Staged {
    /// Checksums of the parts accepted so far, in order.
    accepted: Vec<String>,
    size: u64,
    /// Bytes accepted but not yet sent as an S3 part.
    pending: BytesMut,
    sent: Vec<SentPart>,
}

impl Staged {
    fn progress(&self) -> UploadProgress {
        UploadProgress {
            size: self.size,
            parts: self.accepted.len() as u32,
        }
    }

    fn next_number(&self) -> i32 {
        self.sent.len() as i32 + 1
    }

    /// Undo the most recent [`Driver::upload_part`] whose flush of `flushed`
    /// failed. `accepted_len` is the size of the part being undone.
    fn rollback(&mut self, flushed: Bytes, accepted_len: usize) {
        self.accepted.pop();
        self.size -= accepted_len as u64;
        let keep = flushed.len() - accepted_len;
        let mut pending = BytesMut::from(&flushed[..keep]);
        pending.extend_from_slice(&self.pending);
        self.pending = pending;
    }
}

/// Storage driver for S3-compatible object stores.
///
/// Each multipart upload is backed by an S3 multipart upload. The driver
/// remembers which key each open upload targets and holds the bytes not yet
/// sent, so progress can be reported without a `ListParts` round trip and
/// abandoned uploads can be aborted by the garbage collector.
///
/// Parts of one upload must be sent one at a time.
#[derive(Debug)]
pub struct S3Driver {
    client: Client,
    max_parts: u32,
    min_part_size: u64,
    uploads: SessionManager<S3Upload, Staged>,
}

fn error_kind<E>(error: &SdkError<E, HttpResponse>) -> StorageErrorKind {
    match error {
        SdkError::TimeoutError(_) => StorageErrorKind::Timeout,
        SdkError::DispatchFailure(_) => StorageErrorKind::ServiceUnavailable,
        SdkError::ConstructionFailure(_) => StorageErrorKind::InvalidRequest,
        _ => match error.raw_response().map(|response| response.status().as_u16()) {
            Some(404) => StorageErrorKind::NotFound,
            Some(401) | Some(403) => StorageErrorKind::PermissionDenied,
            Some(400) => StorageErrorKind::InvalidRequest,
            Some(500..=599) => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Io,
        },
    }
}

fn s3_error<E>(
    context: &'static str,
    bucket: &str,
    key: &Utf8Path,
) -> impl FnOnce(SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + 'static,
{
    let bucket = bucket.to_owned();
    let key = key.to_string();
    move |error| {
        StorageError::builder(
            ENGINE,
            error_kind(&error),
            DisplayErrorContext(&error).to_string(),
        )
        .bucket(bucket)
        .path(key)
        .context(format!("{ENGINE}: {context}"))
        .build()
    }
}

impl S3Driver {
    /// Build a client from configuration. No network calls are made.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key.revealed(),
            None,
            None,
            "registry-config",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            max_parts: config.max_parts,
            min_part_size: config.min_part_size.max(1),
            uploads: SessionManager::new(DEFAULT_SESSION_TTL),
        }
    }

    /// Set the inactivity timeout for multipart uploads.
    pub fn with_session_ttl(self, ttl: Duration) -> Self {
        self.uploads.set_ttl(ttl);
        self
    }

    fn check_upload(
        &self,
        bucket: &str,
        key: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        match self
            .uploads
            .with_session(upload_id, |upload| upload.bucket == bucket && upload.key == key)
        {
            Some(true) => Ok(()),
            Some(false) => Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("upload {upload_id} was opened for a different object"),
            )
            .bucket(bucket)
            .path(key.as_str())
            .build()),
            None => Err(StorageError::upload_unknown(ENGINE, upload_id)),
        }
    }

    async fn send_part(
        &self,
        bucket: &str,
        key: &Utf8Path,
        upload_id: &UploadId,
        number: i32,
        content: Bytes,
    ) -> Result<SentPart, StorageError> {
        let sent = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .part_number(number)
            .body(ByteStream::from(content))
            .send()
            .await;

        match sent {
            Ok(output) => Ok(SentPart {
                number,
                etag: output.e_tag().unwrap_or_default().to_owned(),
            }),
            Err(error) => {
                let error = s3_error("upload part", bucket, key)(error);
                if error.kind() == StorageErrorKind::NotFound {
                    return Err(StorageError::upload_unknown(ENGINE, upload_id)
                        .with_context(format!("{ENGINE}: upload part")));
                }
                Err(error)
            }
        }
    }

    /// Store an upload which never filled a part as a single object.
    async fn put_small(
        &self,
        bucket: &str,
        key: &Utf8Path,
        upload_id: &UploadId,
        content: Bytes,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key.as_str())
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(s3_error("put object", bucket, key))?;

        if let Err(error) = self.abort(bucket, key, upload_id).await {
            tracing::warn!(%upload_id, "failed to abort unused multipart upload: {error}");
        }
        Ok(())
    }

    async fn abort(
        &self,
        bucket: &str,
        key: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error_kind(&error) == StorageErrorKind::NotFound => {
                tracing::trace!(%upload_id, "multipart upload already gone");
                Ok(())
            }
            Err(error) => Err(s3_error("abort multipart upload", bucket, key)(error)),
        }
    }
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "s3"
    }

    fn max_parts(&self) -> u32 {
        self.max_parts
    }

    #[tracing::instrument(skip(self))]
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(s3_error("head object", bucket, remote))?;

        let created = head
            .last_modified()
            .and_then(|modified| {
                DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos())
            })
            .unwrap_or_else(Utc::now);

        Ok(Metadata {
            size: head.content_length().unwrap_or_default().max(0) as u64,
            created,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(s3_error("delete object", bucket, remote))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, reader))]
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|error| io_error_to_storage(ENGINE, error))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(remote.as_str())
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(s3_error("put object", bucket, remote))?;

        Ok(remote.to_owned())
    }

    #[tracing::instrument(skip(self, writer))]
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(s3_error("get object", bucket, remote))?;

        let mut body = object.body;
        while let Some(chunk) = body.try_next().await.map_err(|error| {
            StorageError::builder(ENGINE, StorageErrorKind::Io, error)
                .bucket(bucket)
                .path(remote.as_str())
                .context("s3: read object body")
                .build()
        })? {
            writer
                .write_all(&chunk)
                .await
                .map_err(|error| io_error_to_storage(ENGINE, error))?;
        }

        writer
            .flush()
            .await
            .map_err(|error| io_error_to_storage(ENGINE, error))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        let listing = prefix.unwrap_or(Utf8Path::new(""));

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(|p| p.to_string()))
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(s3_error("list objects", bucket, listing))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_owned)),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or_default() => {
                    continuation_token = Some(token.to_owned());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    #[tracing::instrument(skip(self))]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(s3_error("create multipart upload", bucket, remote))?;

        let Some(upload_id) = created.upload_id() else {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::SerializationError,
                "create multipart upload returned no upload id",
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        };

        let upload_id = UploadId::from(upload_id);
        self.uploads.insert(
            upload_id.clone(),
            S3Upload {
                bucket: bucket.to_owned(),
                key: remote.to_owned(),
            },
            Staged::default(),
        );
        Ok(upload_id)
    }

    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.check_upload(bucket, remote, upload_id)?;

        let part = CompletedPart::for_content(part_number, &content);
        let max_parts = self.max_parts;
        let min_part_size = self.min_part_size;
        let flush = self
            .uploads
            .with_parts_mut(upload_id, |staged| {
                check_part_number(ENGINE, staged.accepted.len() as u32, part_number, max_parts)?;
                staged.accepted.push(part.checksum.clone());
                staged.size += content.len() as u64;
                staged.pending.extend_from_slice(&content);

                let full = staged.pending.len() as u64 >= min_part_size;
                Ok(full.then(|| (staged.next_number(), staged.pending.split().freeze())))
            })
            .ok_or_else(|| StorageError::upload_unknown(ENGINE, upload_id))?
            .map_err(|error: StorageError| error.with_context(format!("{ENGINE}: upload part")))?;

        let Some((number, chunk)) = flush else {
            return Ok(part);
        };

        tracing::trace!(%upload_id, number, size = chunk.len(), "sending s3 part");
        match self
            .send_part(bucket, remote, upload_id, number, chunk.clone())
            .await
        {
            Ok(sent) => {
                self.uploads
                    .with_parts_mut(upload_id, |staged| staged.sent.push(sent))
                    .ok_or_else(|| StorageError::upload_unknown(ENGINE, upload_id))?;
                Ok(part)
            }
            Err(error) => {
                self.uploads.with_parts_mut(upload_id, |staged| {
                    staged.rollback(chunk, content.len());
                });
                Err(error)
            }
        }
    }

    #[tracing::instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        self.check_upload(bucket, remote, upload_id)?;
        check_part_sequence(ENGINE, parts)?;

        let (mut sent, pending) = self
            .uploads
            .with_parts(upload_id, |staged| {
                let listed = parts.iter().map(|part| &part.checksum);
                if parts.len() != staged.accepted.len() || !listed.eq(&staged.accepted) {
                    return Err(StorageError::builder(
                        ENGINE,
                        StorageErrorKind::InvalidRequest,
                        format!(
                            "completion lists {} parts which do not match the {} uploaded",
                            parts.len(),
                            staged.accepted.len()
                        ),
                    )
                    .bucket(bucket)
                    .path(remote.as_str())
                    .build());
                }
                Ok((staged.sent.clone(), Bytes::copy_from_slice(&staged.pending)))
            })
            .ok_or_else(|| StorageError::upload_unknown(ENGINE, upload_id))??;

        if sent.is_empty() {
            self.put_small(bucket, remote, upload_id, pending).await?;
            self.uploads.remove(upload_id);
            return Ok(remote.to_owned());
        }

        if !pending.is_empty() {
            let number = sent.len() as i32 + 1;
            let last = self
                .send_part(bucket, remote, upload_id, number, pending)
                .await?;
            self.uploads.with_parts_mut(upload_id, |staged| {
                staged.pending.clear();
                staged.sent.push(last.clone());
            });
            sent.push(last);
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                sent.iter()
                    .map(|part| {
                        S3CompletedPart::builder()
                            .part_number(part.number)
                            .e_tag(&part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(remote.as_str())
            .upload_id(upload_id.as_str())
            .multipart_upload(completed)
            .send()
            .await
            .map_err(s3_error("complete multipart upload", bucket, remote))?;

        self.uploads.remove(upload_id);
        Ok(remote.to_owned())
    }

    #[tracing::instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.uploads.remove(upload_id);
        self.abort(bucket, remote, upload_id).await
    }

    async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.check_upload(bucket, remote, upload_id)?;
        self.uploads
            .with_parts(upload_id, Staged::progress)
            .ok_or_else(|| StorageError::upload_unknown(ENGINE, upload_id))
    }

    async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.check_upload(bucket, remote, upload_id)?;
        if self.uploads.touch(upload_id) {
            Ok(())
        } else {
            Err(StorageError::upload_unknown(ENGINE, upload_id))
        }
    }

    fn set_upload_ttl(&self, ttl: Duration) {
        self.uploads.set_ttl(ttl);
    }

    #[tracing::instrument(skip(self))]
    async fn presigned_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let presigning = PresigningConfig::expires_in(expires_in).map_err(|error| {
            StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, error)
                .context("s3: presign")
                .build()
        })?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(remote.as_str())
            .presigned(presigning)
            .await
            .map_err(s3_error("presign get object", bucket, remote))?;

        request.uri().parse::<Uri>().map_err(|error| {
            StorageError::builder(ENGINE, StorageErrorKind::SerializationError, error)
                .bucket(bucket)
                .path(remote.as_str())
                .context("s3: presign")
                .build()
        })
    }

    async fn reap_expired_uploads(&self) -> Result<usize, StorageError> {
        let expired = self.uploads.collect_expired();
        let count = expired.len();
        for (upload_id, upload) in expired {
            if let Err(error) = self.abort(&upload.bucket, &upload.key, &upload_id).await {
                tracing::warn!(%upload_id, "failed to abort expired multipart upload: {error}");
            }
        }
        Ok(count)
    }
}
