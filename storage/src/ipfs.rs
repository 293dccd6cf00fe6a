//! IPFS storage through the Kubo RPC API (`/api/v0`).
//!
//! IPFS is content addressed: an upload returns the CID of the added content,
//! and that CID (not the requested key) is the link used for reads. Buckets and
//! keys have no meaning to the node and are only used for diagnostics.

use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::{StatusCode, Uri};
use reqwest::multipart::{Form, Part};
use secret::Secret;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use storage_driver::{
    CompletedPart, Driver, Metadata, Reader, StorageError, StorageErrorKind, StorageLink,
    UploadId, UploadProgress, Writer, DEFAULT_MAX_PARTS,
};

use crate::buffered::MultipartBuffer;
use crate::io_error_to_storage;
use crate::session::DEFAULT_SESSION_TTL;

const ENGINE: &str = "ipfs";

fn default_max_parts() -> u32 {
    DEFAULT_MAX_PARTS
}

/// Connection settings for a Kubo node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpfsConfig {
    /// Base URL of the RPC API, e.g. `http://127.0.0.1:5001`.
    pub api: String,

    /// Public gateway used for download redirects, e.g. `https://ipfs.io`.
    #[serde(default)]
    pub gateway: Option<String>,

    /// Bearer token sent with every RPC call.
    #[serde(default)]
    pub token: Option<Secret>,

    /// Highest accepted part number for buffered multipart uploads.
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatResponse {
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinList {
    #[serde(default)]
    keys: std::collections::BTreeMap<String, serde::de::IgnoredAny>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KuboError {
    message: String,
}

/// Storage driver for an IPFS (Kubo) node.
///
/// The node has no multipart API, so parts are buffered in memory and added in
/// a single call on completion.
#[derive(Debug)]
pub struct IpfsDriver {
    client: reqwest::Client,
    api: String,
    gateway: Option<String>,
    token: Option<Secret>,
    multipart: MultipartBuffer,
}

/// Classify a failed RPC call from its status and Kubo's error message.
fn rpc_error_kind(status: StatusCode, message: &str) -> StorageErrorKind {
    let message = message.to_ascii_lowercase();
    match status {
        StatusCode::NOT_FOUND => StorageErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageErrorKind::PermissionDenied,
        StatusCode::BAD_REQUEST => StorageErrorKind::InvalidRequest,
        _ if message.contains("not pinned")
            || message.contains("not found")
            || message.contains("no link named") =>
        {
            StorageErrorKind::NotFound
        }
        _ if message.contains("invalid") || message.contains("failed to decode") => {
            StorageErrorKind::InvalidRequest
        }
        status if status.is_server_error() => StorageErrorKind::ServiceUnavailable,
        _ => StorageErrorKind::Other,
    }
}

fn transport_error_kind(error: &reqwest::Error) -> StorageErrorKind {
    if error.is_timeout() {
        StorageErrorKind::Timeout
    } else if error.is_connect() {
        StorageErrorKind::ServiceUnavailable
    } else if error.is_decode() {
        StorageErrorKind::SerializationError
    } else {
        StorageErrorKind::Io
    }
}

impl IpfsDriver {
    /// Create a driver without contacting the node.
    pub fn new(config: IpfsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api: config.api.trim_end_matches('/').to_owned(),
            gateway: config
                .gateway
                .map(|gateway| gateway.trim_end_matches('/').to_owned()),
            token: config.token,
            multipart: MultipartBuffer::new(ENGINE, DEFAULT_SESSION_TTL)
                .with_max_parts(config.max_parts),
        }
    }

    /// Create a driver and check that the node answers.
    #[tracing::instrument(skip(config), fields(api = %config.api))]
    pub async fn connect(config: IpfsConfig) -> Result<Self, StorageError> {
        let driver = Self::new(config);
        let response = driver.rpc("version", &[]).await?;
        let version: VersionResponse = driver.json(response, "version").await?;
        tracing::debug!(version = %version.version, "connected to ipfs node");
        Ok(driver)
    }

    /// Set the inactivity timeout for multipart uploads.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        let max_parts = self.multipart.max_parts();
        self.multipart = MultipartBuffer::new(ENGINE, ttl).with_max_parts(max_parts);
        self
    }

    fn request(&self, endpoint: &str) -> Result<reqwest::RequestBuilder, StorageError> {
        let mut request = self
            .client
            .post(format!("{}/api/v0/{endpoint}", self.api));
        if let Some(token) = &self.token {
            let header = token.bearer().map_err(|error| {
                StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, error)
                    .context("ipfs: authorization header")
                    .build()
            })?;
            request = request.header(http::header::AUTHORIZATION, header);
        }
        Ok(request)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StorageError> {
        let response = request.send().await.map_err(|error| {
            StorageError::builder(ENGINE, transport_error_kind(&error), error)
                .context(format!("ipfs: {endpoint}"))
                .build()
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<KuboError>(&body)
            .map(|error| error.message)
            .unwrap_or(body);
        Err(StorageError::builder(
            ENGINE,
            rpc_error_kind(status, &message),
            format!("{status}: {message}"),
        )
        .context(format!("ipfs: {endpoint}"))
        .build())
    }

    async fn rpc(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, StorageError> {
        let request = self.request(endpoint)?.query(query);
        self.send(endpoint, request).await
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T, StorageError> {
        response.json::<T>().await.map_err(|error| {
            StorageError::builder(ENGINE, StorageErrorKind::SerializationError, error)
                .context(format!("ipfs: decode {endpoint}"))
                .build()
        })
    }

    async fn add(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Vec<u8>,
    ) -> Result<StorageLink, StorageError> {
        let name = remote.file_name().unwrap_or("blob").to_owned();
        let form = Form::new().part("file", Part::bytes(content).file_name(name));
        let request = self
            .request("add")?
            .query(&[("pin", "true"), ("cid-version", "1")])
            .multipart(form);

        let response = self
            .send("add", request)
            .await
            .map_err(|error| error.with_context(format!("ipfs: add {bucket}/{remote}")))?;
        let added: AddResponse = self.json(response, "add").await?;
        tracing::trace!(%remote, cid = %added.hash, "added content to ipfs");
        Ok(Utf8PathBuf::from(added.hash))
    }
}

#[async_trait::async_trait]
impl Driver for IpfsDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "ipfs"
    }

    fn max_parts(&self) -> u32 {
        self.multipart.max_parts()
    }

    #[tracing::instrument(skip(self))]
    async fn metadata(&self, _bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = format!("/ipfs/{remote}");
        let response = self.rpc("files/stat", &[("arg", path.as_str())]).await?;
        let stat: StatResponse = self.json(response, "files/stat").await?;

        // IPFS does not record creation time.
        Ok(Metadata {
            size: stat.size,
            created: DateTime::<Utc>::default(),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, _bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.rpc("pin/rm", &[("arg", remote.as_str())]).await?;
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
        self.add(bucket, remote, buf).await
    }

    #[tracing::instrument(skip(self, writer))]
    async fn download(
        &self,
        _bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut response = self.rpc("cat", &[("arg", remote.as_str())]).await?;

        while let Some(chunk) = response.chunk().await.map_err(|error| {
            StorageError::builder(ENGINE, transport_error_kind(&error), error)
                .path(remote.as_str())
                .context("ipfs: read cat body")
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

    /// Lists recursively pinned CIDs. Prefixes are matched against the CID text.
    #[tracing::instrument(skip(self))]
    async fn list(
        &self,
        _bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let response = self.rpc("pin/ls", &[("type", "recursive")]).await?;
        let pins: PinList = self.json(response, "pin/ls").await?;
        Ok(pins
            .keys
            .into_keys()
            .filter(|cid| prefix.is_none_or(|prefix| cid.starts_with(prefix.as_str())))
            .collect())
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

    #[tracing::instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        let content = self.multipart.assemble(bucket, remote, upload_id, parts)?;
        let link = self.add(bucket, remote, content.to_vec()).await?;
        self.multipart.finish(upload_id);
        Ok(link)
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

    /// Gateway URLs do not expire; `expires_in` is ignored.
    async fn presigned_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        _expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let Some(gateway) = &self.gateway else {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Unsupported,
                "no gateway configured",
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        };

        format!("{gateway}/ipfs/{remote}")
            .parse::<Uri>()
            .map_err(|error| {
                StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, error)
                    .path(remote.as_str())
                    .context("ipfs: gateway url")
                    .build()
            })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IpfsConfig {
        serde_json::from_str(
            r#"{
                "api": "http://127.0.0.1:5001/",
                "gateway": "https://gateway.example/",
                "token": "hunter2"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn kubo_errors_are_classified() {
        assert_eq!(
            rpc_error_kind(StatusCode::INTERNAL_SERVER_ERROR, "not pinned or pinned indirectly"),
            StorageErrorKind::NotFound
        );
        assert_eq!(
            rpc_error_kind(StatusCode::INTERNAL_SERVER_ERROR, "invalid path \"/ipfs/zz\""),
            StorageErrorKind::InvalidRequest
        );
        assert_eq!(
            rpc_error_kind(StatusCode::SERVICE_UNAVAILABLE, "node offline"),
            StorageErrorKind::ServiceUnavailable
        );
        assert_eq!(
            rpc_error_kind(StatusCode::FORBIDDEN, ""),
            StorageErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn presign_uses_gateway() {
        let driver = IpfsDriver::new(config());
        assert!(!format!("{driver:?}").contains("hunter2"));

        let cid = Utf8Path::new("bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy");
        let uri = driver
            .presigned_url("registry", cid, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            uri.to_string(),
            format!("https://gateway.example/ipfs/{cid}")
        );
    }

    #[tokio::test]
    async fn presign_without_gateway_is_unsupported() {
        let mut config = config();
        config.gateway = None;
        let driver = IpfsDriver::new(config);

        let err = driver
            .presigned_url("registry", Utf8Path::new("bafy"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn multipart_is_buffered_locally() {
        let driver = IpfsDriver::new(config());
        let remote = Utf8Path::new("uploads/alice/app/1");

        let id = driver.create_multipart_upload("registry", remote).await.unwrap();
        driver
            .upload_part("registry", remote, &id, 1, Bytes::from_static(b"AAAA"))
            .await
            .unwrap();

        let progress = driver.upload_progress("registry", remote, &id).await.unwrap();
        assert_eq!(progress.size, 4);

        driver
            .abort_multipart_upload("registry", remote, &id)
            .await
            .unwrap();
        let err = driver
            .upload_progress("registry", remote, &id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::UploadUnknown);
    }
}
