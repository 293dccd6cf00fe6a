//! Integration tests for the OCI registry

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use camino::Utf8Path;
use registry::oci::{EMPTY_DIGEST, media_type};
use registry::{Digest, Registry, RegistryBuilder};
use storage::{
    CompletedPart, Driver, MemoryStorage, Metadata, Reader, Storage, StorageError,
    StorageErrorKind, StorageLink, UploadId, UploadProgress, Writer,
};
use tower::ServiceExt;

/// Helper to create a test registry
fn test_registry() -> axum::Router {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new()
        .storage(storage.into())
        .bucket("test-registry")
        .build()
}

async fn send(app: &axum::Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn request(method: &str, uri: impl AsRef<str>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri.as_ref())
        .body(Body::empty())
        .unwrap()
}

fn header_str<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

/// Assert the standard error body and return its first code
async fn error_code(response: Response<Body>) -> String {
    let body = body_json(response).await;
    let error = &body["errors"][0];
    assert!(error["message"].is_string(), "{body}");
    error["code"].as_str().unwrap().to_owned()
}

async fn start_upload(app: &axum::Router, name: &str) -> String {
    let response = send(app, request("POST", format!("/v2/{name}/blobs/uploads/"))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    header_str(&response, "location").to_owned()
}

async fn patch(app: &axum::Router, location: &str, range: &str, data: &'static [u8]) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("PATCH")
            .uri(location)
            .header(header::CONTENT_RANGE, range)
            .header(header::CONTENT_TYPE, media_type::OCTET_STREAM)
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await
}

async fn push_blob(app: &axum::Router, name: &str, data: &'static [u8]) -> Digest {
    let digest = Digest::compute(data);
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{name}/blobs/uploads/?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

async fn push_manifest(
    app: &axum::Router,
    name: &str,
    reference: &str,
    manifest: &serde_json::Value,
) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{name}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, media_type::OCI_MANIFEST)
            .body(Body::from(serde_json::to_vec(manifest).unwrap()))
            .unwrap(),
    )
    .await
}

fn empty_config() -> serde_json::Value {
    serde_json::json!({
        "mediaType": media_type::OCI_EMPTY,
        "digest": EMPTY_DIGEST,
        "size": 2
    })
}

fn artifact(subject: &Digest, subject_size: usize, artifact_type: &str) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "artifactType": artifact_type,
        "config": empty_config(),
        "layers": [],
        "subject": {
            "mediaType": media_type::OCI_MANIFEST,
            "digest": subject,
            "size": subject_size
        },
        "annotations": { "org.example.kind": artifact_type }
    })
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let response = send(&app, request("GET", "/v2/")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
    assert_eq!(body_json(response).await, serde_json::json!({}));
}

#[tokio::test]
async fn test_chunked_upload() {
    let app = test_registry();

    let response = send(&app, request("POST", "/v2/alice/app/blobs/uploads/")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    let location = header_str(&response, "location").to_owned();
    let uuid = header_str(&response, "docker-upload-uuid").to_owned();
    assert_eq!(location, format!("/v2/alice/app/blobs/uploads/{uuid}"));

    let response = patch(&app, &location, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-1");

    let response = patch(&app, &location, "2-3", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-3");

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-3");
    assert_eq!(header_str(&response, "docker-upload-uuid"), uuid);

    let digest = Digest::compute(b"AAAA");
    let response = send(&app, request("PUT", format!("{location}?digest={digest}"))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/alice/app/blobs/{digest}")
    );

    let response = send(&app, request("HEAD", format!("/v2/alice/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), "4");

    let response = send(&app, request("GET", format!("/v2/alice/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"AAAA");
}

#[tokio::test]
async fn test_final_chunk_on_put() {
    let app = test_registry();
    let location = start_upload(&app, "app").await;

    let response = patch(&app, &location, "0-2", b"Hel").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let digest = Digest::compute(b"Hello");
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from("lo"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, request("GET", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(&body_bytes(response).await[..], b"Hello");
}

#[tokio::test]
async fn test_monolithic_post() {
    let app = test_registry();
    let digest = push_blob(&app, "test-repo", b"Hello, OCI Registry!").await;

    let response = send(&app, request("GET", format!("/v2/test-repo/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());
    assert_eq!(&body_bytes(response).await[..], b"Hello, OCI Registry!");
}

#[tokio::test]
async fn test_post_then_put() {
    let app = test_registry();
    let data = b"Hello, OCI Registry!";
    let digest = Digest::compute(data);

    let location = start_upload(&app, "test-repo").await;
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, request("GET", format!("/v2/test-repo/blobs/{digest}"))).await;
    assert_eq!(&body_bytes(response).await[..], data);
}

#[tokio::test]
async fn test_monolithic_upload_path() {
    let app = test_registry();
    let data = b"one shot";
    let digest = Digest::compute(data);

    let response = send(&app, request("POST", "/v2/app/blobs/uploads/")).await;
    let uuid = header_str(&response, "docker-upload-uuid").to_owned();

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/app/blobs/monolithic/upload/{uuid}?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, request("GET", format!("/v2/app/blobs/uploads/{uuid}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, request("HEAD", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_range_gap_is_rejected() {
    let app = test_registry();
    let location = start_upload(&app, "app").await;

    let response = patch(&app, &location, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = patch(&app, &location, "3-4", b"AA").await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    let response = patch(&app, &location, "2-4", b"AA").await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-1");

    let response = patch(&app, &location, "2-3", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let digest = Digest::compute(b"AAAA");
    let response = send(&app, request("PUT", format!("{location}?digest={digest}"))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_digest_mismatch() {
    let app = test_registry();
    let location = start_upload(&app, "app").await;
    patch(&app, &location, "0-3", b"AAAA").await;

    let wrong = Digest::compute(b"BBBB");
    let response = send(&app, request("PUT", format!("{location}?digest={wrong}"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    for digest in [wrong, Digest::compute(b"AAAA")] {
        let response = send(&app, request("HEAD", format!("/v2/app/blobs/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_monolithic_digest_mismatch() {
    let app = test_registry();
    let wrong = Digest::compute(b"something else");

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/app/blobs/uploads/?digest={wrong}"))
            .body(Body::from("AAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
    assert_eq!(body["errors"][0]["detail"]["expected"], wrong.to_string());
    assert_eq!(
        body["errors"][0]["detail"]["actual"],
        Digest::compute(b"AAAA").to_string()
    );
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let storage = Storage::new(MemoryStorage::with_buckets(&["registry"]));
    let registry = RegistryBuilder::new()
        .storage(storage.clone())
        .bucket("registry")
        .finish();
    let app = registry.clone().router();

    let location = start_upload(&app, "app").await;
    let response = patch(&app, &location, "0-3", b"AAAA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    for _ in 0..2 {
        let response = send(&app, request("DELETE", &location)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = patch(&app, &location, "4-7", b"AAAA").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = send(&app, request("DELETE", "/v2/app/blobs/uploads/never-started")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(registry.active_uploads(), 0);
    assert!(storage.list("registry", None).await.unwrap().is_empty());
    assert_eq!(storage.reap_expired_uploads().await.unwrap(), 0);
}

#[tokio::test]
async fn test_upload_belongs_to_its_repository() {
    let app = test_registry();
    let location = start_upload(&app, "alice/app").await;
    let uuid = location.rsplit('/').next().unwrap().to_owned();

    let response = patch(&app, &format!("/v2/bob/app/blobs/uploads/{uuid}"), "0-3", b"AAAA").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = patch(&app, &location, "0-3", b"AAAA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_blob_head_is_idempotent() {
    let app = test_registry();
    let digest = push_blob(&app, "app", b"test blob data").await;

    for _ in 0..3 {
        let response = send(&app, request("HEAD", format!("/v2/app/blobs/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-length"), "14");
        assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());
        assert!(body_bytes(response).await.is_empty());
    }
}

#[tokio::test]
async fn test_blob_delete() {
    let app = test_registry();
    let digest = push_blob(&app, "app", b"short lived").await;

    let response = send(&app, request("DELETE", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(&app, request("HEAD", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, request("DELETE", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_cross_repository_mount() {
    let app = test_registry();
    let digest = push_blob(&app, "alice/app", b"shared layer").await;

    let response = send(
        &app,
        request(
            "POST",
            format!("/v2/bob/app/blobs/uploads/?mount={digest}&from=alice/app"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/bob/app/blobs/{digest}")
    );

    let missing = Digest::compute(b"not pushed");
    let response = send(
        &app,
        request(
            "POST",
            format!("/v2/bob/app/blobs/uploads/?mount={missing}&from=alice/app"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test(start_paused = true)]
async fn test_idle_uploads_expire() {
    let registry: Registry = RegistryBuilder::new()
        .upload_ttl(Duration::from_secs(5))
        .gc_interval(Duration::from_secs(1))
        .finish();
    let app = registry.clone().router();
    let gc = registry.spawn_gc();

    let idle = start_upload(&app, "app").await;
    let busy = start_upload(&app, "app").await;
    assert_eq!(registry.active_uploads(), 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let response = patch(&app, &busy, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(registry.active_uploads(), 1);

    let response = send(&app, request("GET", &idle)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, request("GET", &busy)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-1");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(registry.active_uploads(), 0);

    gc.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_upload_ttl_reaches_the_backend() {
    let app = RegistryBuilder::new()
        .upload_ttl(Duration::from_secs(600))
        .build();
    let location = start_upload(&app, "app").await;

    let response = patch(&app, &location, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_secs(360)).await;
    let response = patch(&app, &location, "2-3", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-3");
}

#[tokio::test(start_paused = true)]
async fn test_status_keeps_the_upload_alive() {
    let app = test_registry();
    let location = start_upload(&app, "app").await;

    let response = patch(&app, &location, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_secs(240)).await;
    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let response = patch(&app, &location, "2-3", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let digest = Digest::compute(b"AAAA");
    let response = send(&app, request("PUT", format!("{location}?digest={digest}"))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

/// In-memory storage which fails selected multipart calls.
#[derive(Debug)]
struct FlakyBackend {
    inner: MemoryStorage,
    fail_next_complete: AtomicBool,
    fail_aborts: bool,
}

impl FlakyBackend {
    fn new(bucket: &str) -> Self {
        Self {
            inner: MemoryStorage::with_buckets(&[bucket]),
            fail_next_complete: AtomicBool::new(false),
            fail_aborts: false,
        }
    }

    fn failing_next_complete(self) -> Self {
        self.fail_next_complete.store(true, Ordering::SeqCst);
        self
    }

    fn failing_aborts(mut self) -> Self {
        self.fail_aborts = true;
        self
    }
}

#[async_trait::async_trait]
impl Driver for FlakyBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.inner.delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.inner.metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError> {
        self.inner.upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.inner.download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.list(bucket, prefix).await
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.inner.create_multipart_upload(bucket, remote).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.inner
            .upload_part(bucket, remote, upload_id, part_number, content)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        if self.fail_next_complete.swap(false, Ordering::SeqCst) {
            return Err(StorageError::new(
                "memory",
                StorageErrorKind::ServiceUnavailable,
                "backend restarting",
            ));
        }
        self.inner
            .complete_multipart_upload(bucket, remote, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        if self.fail_aborts {
            return Err(StorageError::new(
                "memory",
                StorageErrorKind::Io,
                "connection reset",
            ));
        }
        self.inner
            .abort_multipart_upload(bucket, remote, upload_id)
            .await
    }

    async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.inner.upload_progress(bucket, remote, upload_id).await
    }

    async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.inner
            .touch_multipart_upload(bucket, remote, upload_id)
            .await
    }

    fn set_upload_ttl(&self, ttl: Duration) {
        self.inner.set_upload_ttl(ttl);
    }
}

#[tokio::test]
async fn test_failed_completion_can_be_retried() {
    let app = RegistryBuilder::new()
        .storage(Storage::new(
            FlakyBackend::new("registry").failing_next_complete(),
        ))
        .bucket("registry")
        .build();
    let location = start_upload(&app, "app").await;

    let response = patch(&app, &location, "0-1", b"AA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let digest = Digest::compute(b"AAAA");
    let complete = || {
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from("AA"))
            .unwrap()
    };

    let response = send(&app, complete()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(response).await, "UNKNOWN");

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-3");

    let response = send(&app, complete()).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, request("GET", format!("/v2/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"AAAA");

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_known_blob_completes_when_abort_fails() {
    let app = RegistryBuilder::new()
        .storage(Storage::new(FlakyBackend::new("registry").failing_aborts()))
        .bucket("registry")
        .build();
    let digest = push_blob(&app, "app", b"AAAA").await;

    let location = start_upload(&app, "app").await;
    let response = patch(&app, &location, "0-3", b"AAAA").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(&app, request("PUT", format!("{location}?digest={digest}"))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());

    let response = send(&app, request("GET", &location)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let app = test_registry();
    let config = push_blob(&app, "test-repo", b"{\"architecture\":\"amd64\"}").await;
    let layer = push_blob(&app, "test-repo", b"layer bytes").await;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config,
            "size": 24
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer,
            "size": 11
        }]
    });
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    let expected = Digest::compute(&manifest_bytes);

    let response = push_manifest(&app, "test-repo", "latest", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), expected.to_string());
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/test-repo/manifests/{expected}")
    );
    assert!(response.headers().get("oci-subject").is_none());

    for reference in ["latest".to_owned(), expected.to_string()] {
        let response = send(&app, request("GET", format!("/v2/test-repo/manifests/{reference}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-type"), media_type::OCI_MANIFEST);
        assert_eq!(header_str(&response, "docker-content-digest"), expected.to_string());
        assert_eq!(&body_bytes(response).await[..], &manifest_bytes[..]);
    }

    let response = send(&app, request("HEAD", "/v2/test-repo/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "content-length"),
        manifest_bytes.len().to_string()
    );

    let response = send(&app, request("DELETE", "/v2/test-repo/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(&app, request("GET", "/v2/test-repo/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let by_digest = format!("/v2/test-repo/manifests/{expected}");
    let response = send(&app, request("GET", &by_digest)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, request("DELETE", &by_digest)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(&app, request("GET", &by_digest)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_blob_unknown() {
    let app = test_registry();
    let missing = Digest::compute(b"never pushed");

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "config": empty_config(),
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": missing,
            "size": 12
        }]
    });

    let response = push_manifest(&app, "app", "v1", &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "MANIFEST_BLOB_UNKNOWN");
    assert_eq!(errors[0]["detail"]["digest"], missing.to_string());
}

#[tokio::test]
async fn test_manifest_validation() {
    let app = test_registry();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "config": empty_config(),
        "layers": []
    });

    let wrong = Digest::compute(b"not this manifest");
    let response = push_manifest(&app, "app", &wrong.to_string(), &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = push_manifest(&app, "app", "-bad-tag", &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "TAG_INVALID");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v2/app/manifests/v1")
            .header(header::CONTENT_TYPE, media_type::OCI_MANIFEST)
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v2/app/manifests/v1")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(serde_json::to_vec(&manifest).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(error_code(response).await, "UNSUPPORTED");

    let digest = Digest::compute(&serde_json::to_vec(&manifest).unwrap());
    let response = push_manifest(&app, "app", &digest.to_string(), &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_list_tags() {
    let app = test_registry();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "config": empty_config(),
        "layers": []
    });

    for tag in ["v1.1", "latest", "v1.0"] {
        let response = push_manifest(&app, "test-repo", tag, &manifest).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = send(&app, request("GET", "/v2/test-repo/tags/list")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("link").is_none());
    let tag_list = body_json(response).await;
    assert_eq!(tag_list["name"], "test-repo");
    assert_eq!(tag_list["tags"], serde_json::json!(["latest", "v1.0", "v1.1"]));

    let response = send(&app, request("GET", "/v2/test-repo/tags/list?n=2")).await;
    assert_eq!(
        header_str(&response, "link"),
        "</v2/test-repo/tags/list?n=2&last=v1.0>; rel=\"next\""
    );
    assert_eq!(body_json(response).await["tags"], serde_json::json!(["latest", "v1.0"]));

    let response = send(&app, request("GET", "/v2/test-repo/tags/list?n=2&last=v1.0")).await;
    assert!(response.headers().get("link").is_none());
    assert_eq!(body_json(response).await["tags"], serde_json::json!(["v1.1"]));

    let response = send(&app, request("GET", "/v2/other/tags/list")).await;
    assert_eq!(body_json(response).await["tags"], serde_json::json!([]));
}

#[tokio::test]
async fn test_referrers() {
    let app = test_registry();
    let image = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_MANIFEST,
        "config": empty_config(),
        "layers": []
    });
    let image_bytes = serde_json::to_vec(&image).unwrap();
    let subject = Digest::compute(&image_bytes);

    let response = push_manifest(&app, "alice/app", "v1", &image).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let referrers_uri = format!("/v2/alice/app/referrers/{subject}");
    let response = send(&app, request("GET", &referrers_uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-type"), media_type::OCI_INDEX);
    assert_eq!(body_json(response).await["manifests"], serde_json::json!([]));

    let mut pushed = Vec::new();
    for artifact_type in ["application/vnd.example.sbom", "application/vnd.example.signature"] {
        let manifest = artifact(&subject, image_bytes.len(), artifact_type);
        let digest = Digest::compute(&serde_json::to_vec(&manifest).unwrap());
        let response = push_manifest(&app, "alice/app", &digest.to_string(), &manifest).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(header_str(&response, "oci-subject"), subject.to_string());
        pushed.push(digest);
    }

    let response = send(&app, request("GET", &referrers_uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("oci-filters-applied").is_none());
    let index = body_json(response).await;
    assert_eq!(index["schemaVersion"], 2);
    assert_eq!(index["mediaType"], media_type::OCI_INDEX);
    let manifests = index["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 2);
    for descriptor in manifests {
        assert_eq!(descriptor["mediaType"], media_type::OCI_MANIFEST);
        assert!(descriptor["artifactType"].is_string());
        assert_eq!(
            descriptor["annotations"]["org.example.kind"],
            descriptor["artifactType"]
        );
    }

    let response = send(
        &app,
        request(
            "GET",
            format!("{referrers_uri}?artifactType=application/vnd.example.sbom"),
        ),
    )
    .await;
    assert_eq!(header_str(&response, "oci-filters-applied"), "artifactType");
    let index = body_json(response).await;
    assert_eq!(index["manifests"].as_array().unwrap().len(), 1);
    assert_eq!(index["manifests"][0]["digest"], pushed[0].to_string());

    let response = send(&app, request("GET", format!("/v2/bob/app/referrers/{subject}"))).await;
    assert_eq!(body_json(response).await["manifests"], serde_json::json!([]));

    for digest in &pushed {
        let response = send(&app, request("DELETE", format!("/v2/alice/app/manifests/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = send(&app, request("GET", &referrers_uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["manifests"], serde_json::json!([]));
}

#[tokio::test]
async fn test_blob_not_found() {
    let app = test_registry();
    let digest = Digest::compute(b"nonexistent");

    let response = send(&app, request("GET", format!("/v2/test-repo/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_digest() {
    let app = test_registry();

    let response = send(&app, request("GET", "/v2/test-repo/blobs/invalid-digest")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn test_invalid_name() {
    let app = test_registry();

    let response = send(&app, request("POST", "/v2/Alice/App/blobs/uploads/")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");
}

#[tokio::test]
async fn test_unsupported_method() {
    let app = test_registry();

    let response = send(&app, request("POST", "/v2/app/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "UNSUPPORTED");

    let response = send(&app, request("GET", "/v2/app/nothing-here")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
