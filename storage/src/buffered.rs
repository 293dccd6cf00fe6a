//! Multipart emulation for backends without a native multipart API.
//!
//! Parts are held in memory by a [`SessionManager`] until completion, at which
//! point they are concatenated in part-number order and handed back to the
//! driver for a single atomic upload.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use storage_driver::{
    check_part_number, check_part_sequence, CompletedPart, StorageError, StorageErrorKind,
    UploadId, UploadProgress, DEFAULT_MAX_PARTS,
};

use crate::session::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    bucket: String,
    remote: Utf8PathBuf,
}

#[derive(Debug, Default)]
struct Buffered {
    parts: Vec<Bytes>,
    size: u64,
}

/// In-memory part accumulator shared by the buffering drivers.
#[derive(Debug, Clone)]
pub struct MultipartBuffer {
    engine: &'static str,
    max_parts: u32,
    sessions: SessionManager<Target, Buffered>,
}

impl MultipartBuffer {
    /// Create a buffer for `engine` whose sessions expire after `ttl` of inactivity.
    pub fn new(engine: &'static str, ttl: Duration) -> Self {
        Self {
            engine,
            max_parts: DEFAULT_MAX_PARTS,
            sessions: SessionManager::new(ttl),
        }
    }

    /// Set the part-number ceiling.
    pub fn with_max_parts(mut self, max_parts: u32) -> Self {
        self.max_parts = max_parts;
        self
    }

    /// The part-number ceiling.
    pub fn max_parts(&self) -> u32 {
        self.max_parts
    }

    /// Change the inactivity timeout of every session.
    pub fn set_ttl(&self, ttl: Duration) {
        self.sessions.set_ttl(ttl);
    }

    fn unknown(&self, bucket: &str, remote: &Utf8Path, id: &UploadId) -> StorageError {
        StorageError::builder(
            self.engine,
            StorageErrorKind::UploadUnknown,
            format!("Upload not found: {id}"),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build()
    }

    fn check_target(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        id: &UploadId,
    ) -> Result<(), StorageError> {
        let matches = self
            .sessions
            .with_session(id, |target| {
                target.bucket == bucket && target.remote == remote
            })
            .ok_or_else(|| self.unknown(bucket, remote, id))?;

        if !matches {
            return Err(StorageError::builder(
                self.engine,
                StorageErrorKind::InvalidRequest,
                format!("upload {id} was opened for a different object"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        Ok(())
    }

    /// Open a new buffered session for `bucket/remote`.
    pub fn create(&self, bucket: &str, remote: &Utf8Path) -> UploadId {
        let id = self.sessions.open(
            Target {
                bucket: bucket.to_owned(),
                remote: remote.to_owned(),
            },
            Buffered::default(),
        );
        tracing::trace!(engine = self.engine, %id, %remote, "opened buffered multipart upload");
        id
    }

    /// Append the next part.
    pub fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.check_target(bucket, remote, id)?;

        let engine = self.engine;
        let max_parts = self.max_parts;
        self.sessions
            .with_parts_mut(id, |buffered| {
                check_part_number(engine, buffered.parts.len() as u32, part_number, max_parts)?;
                let part = CompletedPart::for_content(part_number, &content);
                buffered.size += content.len() as u64;
                buffered.parts.push(content);
                Ok(part)
            })
            .ok_or_else(|| self.unknown(bucket, remote, id))?
            .map_err(|error: StorageError| {
                error.with_context(format!("{engine}: upload part"))
            })
    }

    /// Push back the expiry of a session.
    pub fn touch(&self, bucket: &str, remote: &Utf8Path, id: &UploadId) -> Result<(), StorageError> {
        self.check_target(bucket, remote, id)?;
        if self.sessions.touch(id) {
            Ok(())
        } else {
            Err(self.unknown(bucket, remote, id))
        }
    }

    /// Bytes and parts received so far.
    pub fn progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.check_target(bucket, remote, id)?;
        self.sessions
            .with_parts(id, |buffered| UploadProgress {
                size: buffered.size,
                parts: buffered.parts.len() as u32,
            })
            .ok_or_else(|| self.unknown(bucket, remote, id))
    }

    /// Concatenate the buffered parts named by `parts`, in order.
    ///
    /// The session is left in place so that a failed upload of the assembled
    /// content can be retried; call [`MultipartBuffer::finish`] once stored.
    pub fn assemble(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<Bytes, StorageError> {
        self.check_target(bucket, remote, id)?;
        check_part_sequence(self.engine, parts)?;

        let engine = self.engine;
        self.sessions
            .with_parts(id, |buffered| {
                if buffered.parts.len() != parts.len() {
                    return Err(StorageError::builder(
                        engine,
                        StorageErrorKind::InvalidRequest,
                        format!(
                            "completion lists {} parts, {} were uploaded",
                            parts.len(),
                            buffered.parts.len()
                        ),
                    )
                    .build());
                }

                let mut content = BytesMut::with_capacity(buffered.size as usize);
                for (part, data) in parts.iter().zip(&buffered.parts) {
                    let received = CompletedPart::for_content(part.part_number, data);
                    if received.checksum != part.checksum {
                        return Err(StorageError::builder(
                            engine,
                            StorageErrorKind::InvalidRequest,
                            format!("checksum mismatch for part {}", part.part_number),
                        )
                        .build());
                    }
                    content.extend_from_slice(data);
                }
                Ok(content.freeze())
            })
            .ok_or_else(|| self.unknown(bucket, remote, id))?
            .map_err(|error| error.with_context(format!("{engine}: complete multipart upload")))
    }

    /// Drop a completed session.
    pub fn finish(&self, id: &UploadId) {
        self.sessions.remove(id);
    }

    /// Drop a session, whether or not it exists.
    pub fn abort(&self, id: &UploadId) {
        if self.sessions.remove(id) {
            tracing::trace!(engine = self.engine, %id, "aborted buffered multipart upload");
        }
    }

    /// Reclaim expired sessions, returning how many were dropped.
    pub fn reap_expired(&self) -> usize {
        self.sessions.collect_expired().len()
    }
}
