//! Blob operations for the registry
//!
//! Uploads move through `NotStarted -> InProgress -> Completed`, or end in
//! `Aborted`. An in-progress upload is a registry session (namespace, target
//! path and the backend multipart id once one is open) plus an
//! [`UploadLedger`] tracking bytes written, the running digest and the parts
//! handed to the backend.
//!
//! Every operation that changes an upload first locks its ledger and only then
//! looks at the session table, so a chunk and an abort for the same upload are
//! serialized: either the chunk lands and the abort then discards it, or the
//! abort wins and the chunk fails with `BLOB_UPLOAD_UNKNOWN`.
//!
//! The backend upload shares the session's lifetime: every request which
//! refreshes the session also touches the backend, and a backend which has
//! lost the upload ends the session. A completion which fails on the server
//! side leaves the session open so the client can repeat the `PUT`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use camino::Utf8PathBuf;
use storage::{
    CompletedPart, SessionManager, StorageError, StorageErrorKind, StorageLink, UploadId,
};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use crate::api::Registry;
use crate::catalog::LayerRecord;
use crate::digest::{Digest, DigestWriter};
use crate::error::{RegistryError, RegistryResult};
use crate::oci::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, media_type};
use crate::storage::RegistryStorage;

const STREAM_BUFFER: usize = 64 * 1024;

/// Registry-level upload sessions.
pub(crate) type Uploads = SessionManager<UploadSession, Arc<Mutex<UploadLedger>>>;

/// Where an in-progress upload is headed.
#[derive(Debug, Clone)]
pub(crate) struct UploadSession {
    namespace: String,
    path: Utf8PathBuf,
    backend: Option<UploadId>,
}

/// Progress of an in-progress upload.
#[derive(Debug, Default)]
pub(crate) struct UploadLedger {
    hasher: DigestWriter,
    parts: Vec<CompletedPart>,
    /// Digest confirmed by a completion whose final chunk has been appended.
    verified: Option<Digest>,
}

impl UploadLedger {
    fn written(&self) -> u64 {
        self.hasher.written()
    }
}

/// Inclusive byte range declared by a `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    end: u64,
}

impl ContentRange {
    /// Accepts `<start>-<end>`, optionally written as `bytes <start>-<end>/<total>`.
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix("bytes ").unwrap_or(value);
        let value = value.split_once('/').map_or(value, |(range, _)| range);
        let (start, end) = value.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        (start <= end).then_some(ContentRange { start, end })
    }

    fn from_headers(headers: &HeaderMap) -> RegistryResult<Option<Self>> {
        let Some(value) = headers.get(header::CONTENT_RANGE) else {
            return Ok(None);
        };
        value
            .to_str()
            .ok()
            .and_then(ContentRange::parse)
            .map(Some)
            .ok_or_else(|| RegistryError::RangeInvalid(format!("{value:?}")))
    }

    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

fn upload_location(name: &str, id: &UploadId) -> String {
    format!("/v2/{name}/blobs/uploads/{id}")
}

fn blob_location(name: &str, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

/// The `Range` header for an upload with `written` bytes.
fn upload_range(written: u64) -> String {
    match written {
        0 => "0-0".to_owned(),
        n => format!("0-{}", n - 1),
    }
}

fn upload_response(status: StatusCode, name: &str, id: &UploadId, written: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, upload_location(name, id)),
            (header::RANGE, upload_range(written)),
            (DOCKER_UPLOAD_UUID, id.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

fn created(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(name, digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

fn claimed_digest(query: &HashMap<String, String>) -> RegistryResult<Digest> {
    let digest = query
        .get("digest")
        .ok_or_else(|| RegistryError::DigestInvalid("missing digest parameter".to_owned()))?;
    Ok(Digest::parse(digest)?)
}

fn unknown_upload(id: &UploadId) -> RegistryError {
    RegistryError::BlobUploadUnknown(id.to_string())
}

impl Registry {
    /// The ledger of a live upload in `namespace`, refreshing its expiry.
    fn ledger(&self, namespace: &str, id: &UploadId) -> RegistryResult<Arc<Mutex<UploadLedger>>> {
        let belongs = self
            .uploads
            .with_session(id, |session| session.namespace == namespace)
            .unwrap_or(false);
        if !belongs {
            return Err(unknown_upload(id));
        }

        self.uploads
            .with_parts_mut(id, |ledger| Arc::clone(ledger))
            .ok_or_else(|| unknown_upload(id))
    }

    /// Snapshot of a live session. Must be called with its ledger locked.
    fn live_session(&self, id: &UploadId) -> RegistryResult<UploadSession> {
        self.uploads
            .with_session(id, UploadSession::clone)
            .ok_or_else(|| unknown_upload(id))
    }

    /// Turn a backend failure into a registry error, ending the session when
    /// the backend no longer knows the upload.
    fn backend_error(&self, id: &UploadId, error: StorageError) -> RegistryError {
        if error.kind() == StorageErrorKind::UploadUnknown {
            tracing::debug!(upload = %id, "backend upload is gone, dropping session");
            self.uploads.remove(id);
        }
        error.into()
    }

    /// Push back the expiry of the backend upload, if one is open.
    async fn touch_backend(&self, id: &UploadId, session: &UploadSession) -> RegistryResult<()> {
        let Some(backend) = &session.backend else {
            return Ok(());
        };
        self.storage
            .bucket()
            .touch_multipart_upload(&session.path, backend)
            .await
            .map_err(|error| self.backend_error(id, error))
    }

    /// End a session and release its backend upload.
    async fn discard(&self, id: &UploadId, session: &UploadSession) {
        self.uploads.remove(id);
        let Some(backend) = &session.backend else {
            return;
        };
        if let Err(error) = self
            .storage
            .bucket()
            .abort_multipart_upload(&session.path, backend)
            .await
        {
            tracing::warn!(upload = %id, "failed to abort backend upload: {error}");
        }
    }

    /// End a session once storing its blob has either succeeded or failed
    /// for good.
    fn settle<T>(&self, id: &UploadId, result: &RegistryResult<T>) {
        match result {
            Err(error) if error.status_code().is_server_error() => {
                tracing::debug!(upload = %id, "keeping upload open for a retry");
            }
            _ => {
                self.uploads.remove(id);
            }
        }
    }

    /// Delete stored content unless another record still links to it.
    pub(crate) async fn release(&self, link: &StorageLink) -> RegistryResult<()> {
        if self.catalog.is_linked(link).await? {
            tracing::debug!(%link, "content still referenced, keeping it");
            return Ok(());
        }
        self.storage.remove(link).await
    }

    /// Hand `chunk` to the backend as the next part, opening the backend
    /// multipart upload on first use.
    async fn append(
        &self,
        id: &UploadId,
        session: &mut UploadSession,
        ledger: &mut UploadLedger,
        chunk: Bytes,
    ) -> RegistryResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let bucket = self.storage.bucket();
        let backend = match &session.backend {
            Some(backend) => backend.clone(),
            None => {
                let backend = bucket.create_multipart_upload(&session.path).await?;
                tracing::debug!(upload = %backend, path = %session.path, "opened backend upload");
                session.backend = Some(backend.clone());
                backend
            }
        };

        let part_number = u32::try_from(ledger.parts.len() + 1)
            .map_err(|_| RegistryError::SizeInvalid("too many chunks".to_owned()))?;
        let part = bucket
            .upload_part(&session.path, &backend, part_number, chunk.clone())
            .await
            .map_err(|error| self.backend_error(id, error))?;

        ledger.hasher.update(&chunk);
        ledger.parts.push(part);
        Ok(())
    }

    /// Verify and store a blob received in a single request.
    async fn store_blob(&self, claimed: &Digest, data: &[u8]) -> RegistryResult<()> {
        let actual = Digest::compute(data);
        if actual != *claimed {
            return Err(RegistryError::DigestMismatch {
                expected: claimed.to_string(),
                actual,
            });
        }

        if self.catalog.get_layer(claimed).await?.is_some() {
            tracing::debug!(digest = %claimed, "blob already present");
            return Ok(());
        }

        let storage_link = self.storage.put_blob(claimed, data).await?;
        self.catalog
            .put_layer(LayerRecord {
                digest: claimed.clone(),
                media_type: media_type::OCTET_STREAM.to_owned(),
                size: data.len() as u64,
                storage_link,
            })
            .await?;
        Ok(())
    }

    /// Sweep expired upload sessions and release their backend uploads.
    ///
    /// Returns the number of registry sessions reclaimed.
    pub async fn collect_expired_uploads(&self) -> usize {
        let expired = self.uploads.collect_expired();
        let count = expired.len();

        for (id, session) in expired {
            let Some(backend) = session.backend else {
                continue;
            };
            if let Err(error) = self
                .storage
                .bucket()
                .abort_multipart_upload(&session.path, &backend)
                .await
            {
                tracing::warn!(upload = %id, "failed to abort expired upload: {error}");
            }
        }

        match self.storage.bucket().storage().reap_expired_uploads().await {
            Ok(0) => {}
            Ok(reaped) => tracing::debug!(reaped, "reaped backend multipart uploads"),
            Err(error) => tracing::warn!("backend multipart gc failed: {error}"),
        }

        count
    }
}

/// Start a blob upload session, or finish one in a single request
#[tracing::instrument(skip(registry, body), fields(size = body.len()))]
pub(crate) async fn start_upload(
    registry: &Registry,
    name: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    if let (Some(mount), Some(from)) = (query.get("mount"), query.get("from")) {
        let digest = Digest::parse(mount)?;
        if registry.catalog.get_layer(&digest).await?.is_some() {
            tracing::debug!(%digest, %from, "mounted blob");
            return Ok(created(name, &digest));
        }
    } else if query.contains_key("digest") {
        let digest = claimed_digest(query)?;
        registry.store_blob(&digest, &body).await?;
        return Ok(created(name, &digest));
    }

    let id = UploadId::new_v4();
    let session = UploadSession {
        namespace: name.to_owned(),
        path: RegistryStorage::upload_path(name, &id),
        backend: None,
    };
    registry.uploads.insert(id.clone(), session, Default::default());
    tracing::debug!(upload = %id, "started upload");

    Ok(upload_response(StatusCode::ACCEPTED, name, &id, 0))
}

/// Append a chunk to an upload
#[tracing::instrument(skip(registry, headers, body), fields(size = body.len()))]
pub(crate) async fn upload_chunk(
    registry: &Registry,
    name: &str,
    id: &UploadId,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let range = ContentRange::from_headers(headers)?;
    let ledger = registry.ledger(name, id)?;
    let mut ledger = ledger.lock().await;
    let mut session = registry.live_session(id)?;

    if let Some(range) = range {
        let written = ledger.written();
        if range.start != written || range.len() != body.len() as u64 {
            return Err(RegistryError::RangeInvalid(format!(
                "{}-{} does not continue upload at {written} with {} bytes",
                range.start,
                range.end,
                body.len()
            )));
        }
    }

    if body.is_empty() {
        registry.touch_backend(id, &session).await?;
    }

    let opened = session.backend.is_none();
    registry.append(id, &mut session, &mut ledger, body).await?;

    if opened && session.backend.is_some() {
        let backend = session.backend.clone();
        registry
            .uploads
            .with_session_mut(id, |live| live.backend = backend)
            .ok_or_else(|| unknown_upload(id))?;
    }

    Ok(upload_response(
        StatusCode::ACCEPTED,
        name,
        id,
        ledger.written(),
    ))
}

/// Report how much of an upload has been received
#[tracing::instrument(skip(registry))]
pub(crate) async fn upload_status(
    registry: &Registry,
    name: &str,
    id: &UploadId,
) -> RegistryResult<Response> {
    let ledger = registry.ledger(name, id)?;
    let ledger = ledger.lock().await;
    let session = registry.live_session(id)?;

    registry.touch_backend(id, &session).await?;
    if let Some(backend) = &session.backend {
        let progress = registry
            .storage
            .bucket()
            .upload_progress(&session.path, backend)
            .await
            .map_err(|error| registry.backend_error(id, error))?;
        if progress.size != ledger.written() {
            tracing::warn!(
                upload = %id,
                backend = progress.size,
                ledger = ledger.written(),
                "backend progress disagrees with ledger"
            );
        }
    }

    Ok(upload_response(
        StatusCode::NO_CONTENT,
        name,
        id,
        ledger.written(),
    ))
}

/// Complete an upload, applying the request body as its final chunk
#[tracing::instrument(skip(registry, query, body), fields(size = body.len()))]
pub(crate) async fn complete_upload(
    registry: &Registry,
    name: &str,
    id: &UploadId,
    query: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    let claimed = claimed_digest(query)?;
    let ledger = registry.ledger(name, id)?;
    let mut ledger = ledger.lock().await;
    let mut session = registry.live_session(id)?;

    if ledger.parts.is_empty() {
        let stored = registry.store_blob(&claimed, &body).await;
        registry.settle(id, &stored);
        stored?;
        return Ok(created(name, &claimed));
    }

    // A repeated PUT carries the final chunk that was already appended.
    if ledger.verified.as_ref() != Some(&claimed) {
        registry.append(id, &mut session, &mut ledger, body).await?;

        let actual = ledger.hasher.digest();
        if actual != claimed {
            tracing::debug!(upload = %id, expected = %claimed, %actual, "upload digest mismatch");
            // The backend upload is left for the driver's reaper.
            registry.uploads.remove(id);
            return Err(RegistryError::DigestMismatch {
                expected: claimed.to_string(),
                actual,
            });
        }
        ledger.verified = Some(claimed.clone());
    }

    let Some(backend) = session.backend.clone() else {
        return Err(RegistryError::BlobUploadInvalid(
            "upload has parts but no backend session".to_owned(),
        ));
    };

    if registry.catalog.get_layer(&claimed).await?.is_some() {
        tracing::debug!(digest = %claimed, "blob already present, discarding upload");
        registry.discard(id, &session).await;
        return Ok(created(name, &claimed));
    }

    let storage_link = registry
        .storage
        .bucket()
        .complete_multipart_upload(&session.path, &backend, &ledger.parts)
        .await
        .map_err(|error| registry.backend_error(id, error))?;
    registry.uploads.remove(id);

    let inserted = registry
        .catalog
        .put_layer(LayerRecord {
            digest: claimed.clone(),
            media_type: media_type::OCTET_STREAM.to_owned(),
            size: ledger.written(),
            storage_link: storage_link.clone(),
        })
        .await?;
    if !inserted {
        registry.release(&storage_link).await?;
    }

    tracing::debug!(digest = %claimed, parts = ledger.parts.len(), "completed upload");
    Ok(created(name, &claimed))
}

/// Store an entire blob sent to a session that has not received any chunks
#[tracing::instrument(skip(registry, query, body), fields(size = body.len()))]
pub(crate) async fn monolithic_upload(
    registry: &Registry,
    name: &str,
    id: &UploadId,
    query: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    let claimed = claimed_digest(query)?;
    let ledger = registry.ledger(name, id)?;
    let ledger = ledger.lock().await;
    registry.live_session(id)?;

    if !ledger.parts.is_empty() {
        return Err(RegistryError::BlobUploadInvalid(format!(
            "upload {id} already received chunks"
        )));
    }

    let stored = registry.store_blob(&claimed, &body).await;
    registry.settle(id, &stored);
    stored?;
    Ok(created(name, &claimed))
}

/// Cancel an upload. Unknown uploads are accepted silently.
#[tracing::instrument(skip(registry))]
pub(crate) async fn abort_upload(
    registry: &Registry,
    name: &str,
    id: &UploadId,
) -> RegistryResult<StatusCode> {
    let Ok(ledger) = registry.ledger(name, id) else {
        return Ok(StatusCode::NO_CONTENT);
    };
    let _ledger = ledger.lock().await;

    let Some((session, _)) = registry.uploads.take(id) else {
        return Ok(StatusCode::NO_CONTENT);
    };

    if let Some(backend) = &session.backend {
        registry
            .storage
            .bucket()
            .abort_multipart_upload(&session.path, backend)
            .await?;
    }

    tracing::debug!(upload = %id, "aborted upload");
    Ok(StatusCode::NO_CONTENT)
}

async fn layer(registry: &Registry, digest: &str) -> RegistryResult<(Digest, LayerRecord)> {
    let digest = Digest::parse(digest)?;
    let record = registry
        .catalog
        .get_layer(&digest)
        .await?
        .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;
    Ok((digest, record))
}

fn blob_headers(record: &LayerRecord) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, record.media_type.clone()),
        (header::CONTENT_LENGTH, record.size.to_string()),
        (DOCKER_CONTENT_DIGEST, record.digest.to_string()),
    ]
}

/// Check if a blob exists
#[tracing::instrument(skip(registry))]
pub(crate) async fn head_blob(registry: &Registry, digest: &str) -> RegistryResult<Response> {
    let (_, record) = layer(registry, digest).await?;
    Ok((StatusCode::OK, blob_headers(&record)).into_response())
}

/// Get a blob, either streamed or as a redirect to a presigned URL
#[tracing::instrument(skip(registry))]
pub(crate) async fn get_blob(registry: &Registry, digest: &str) -> RegistryResult<Response> {
    let (digest, record) = layer(registry, digest).await?;
    let bucket = registry.storage.bucket();

    if registry.redirect_downloads {
        match bucket
            .presigned_url(&record.storage_link, registry.presign_expiry)
            .await
        {
            Ok(uri) => {
                return Ok((
                    StatusCode::TEMPORARY_REDIRECT,
                    [
                        (header::LOCATION, uri.to_string()),
                        (DOCKER_CONTENT_DIGEST, digest.to_string()),
                    ],
                )
                    .into_response());
            }
            Err(error) if error.kind() == StorageErrorKind::Unsupported => {
                tracing::trace!("backend cannot presign, streaming instead");
            }
            Err(error) => return Err(error.into()),
        }
    }

    let (reader, mut writer) = tokio::io::duplex(STREAM_BUFFER);
    let bucket = bucket.clone();
    let link = record.storage_link.clone();
    tokio::spawn(async move {
        if let Err(error) = bucket.download(&link, &mut writer).await {
            tracing::warn!(%link, "blob download failed: {error}");
        }
    });

    Ok((
        StatusCode::OK,
        blob_headers(&record),
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// Delete a blob
#[tracing::instrument(skip(registry))]
pub(crate) async fn delete_blob(registry: &Registry, digest: &str) -> RegistryResult<StatusCode> {
    let digest = Digest::parse(digest)?;
    let record = registry
        .catalog
        .delete_layer(&digest)
        .await?
        .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;

    registry.release(&record.storage_link).await?;
    Ok(StatusCode::ACCEPTED)
}
