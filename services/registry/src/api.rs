//! API server builder and router

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use serde_json::json;
use storage::{DEFAULT_GC_INTERVAL, DEFAULT_SESSION_TTL, GcHandle, MemoryStorage, Storage};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::blob::{self, Uploads};
use crate::catalog::{Catalog, MemoryCatalog};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest;
use crate::oci::DOCKER_DISTRIBUTION_API_VERSION;
use crate::route::{OciRoute, validate_name};
use crate::storage::RegistryStorage;

/// Default bucket name.
pub const DEFAULT_BUCKET: &str = "registry";

/// Default lifetime of presigned download URLs.
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Default cap on a single request body.
pub const DEFAULT_MAX_BODY: usize = 2 * 1024 * 1024 * 1024;

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
    catalog: Option<Arc<dyn Catalog>>,
    upload_ttl: Duration,
    gc_interval: Duration,
    redirect_downloads: bool,
    presign_expiry: Duration,
    max_body: usize,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            catalog: None,
            upload_ttl: DEFAULT_SESSION_TTL,
            gc_interval: DEFAULT_GC_INTERVAL,
            redirect_downloads: false,
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
            max_body: DEFAULT_MAX_BODY,
        }
    }

    /// Set the storage backend
    ///
    /// Without one, the registry keeps everything in memory.
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the metadata catalog
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// How long an upload may sit idle before it is discarded
    ///
    /// The storage backend's multipart uploads are given the same lifetime.
    pub fn upload_ttl(mut self, ttl: Duration) -> Self {
        self.upload_ttl = ttl;
        self
    }

    /// How often expired uploads are swept
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Answer blob downloads with a redirect to a presigned URL when the
    /// backend supports it
    pub fn redirect_downloads(mut self, redirect: bool) -> Self {
        self.redirect_downloads = redirect;
        self
    }

    /// Lifetime of presigned download URLs
    pub fn presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry;
        self
    }

    /// Largest request body accepted, in bytes
    pub fn max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    /// Assemble the registry state
    pub fn finish(self) -> Registry {
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let storage = self
            .storage
            .unwrap_or_else(|| Storage::new(MemoryStorage::with_buckets(&[bucket.as_str()])));
        storage.set_upload_ttl(self.upload_ttl);

        Registry {
            storage: RegistryStorage::new(storage.bucket(bucket)),
            catalog: self
                .catalog
                .unwrap_or_else(|| Arc::new(MemoryCatalog::new())),
            uploads: Uploads::new(self.upload_ttl),
            gc_interval: self.gc_interval,
            redirect_downloads: self.redirect_downloads,
            presign_expiry: self.presign_expiry,
            max_body: self.max_body,
        }
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        self.finish().router()
    }
}

/// Shared state of a running registry.
#[derive(Clone)]
pub struct Registry {
    pub(crate) storage: RegistryStorage,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) uploads: Uploads,
    pub(crate) gc_interval: Duration,
    pub(crate) redirect_downloads: bool,
    pub(crate) presign_expiry: Duration,
    pub(crate) max_body: usize,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("storage", &self.storage)
            .field("uploads", &self.uploads)
            .field("redirect_downloads", &self.redirect_downloads)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// The HTTP interface of this registry
    pub fn router(self) -> Router {
        Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2", get(api_version_check))
            .route("/v2/{*path}", any(dispatch))
            .layer(SetResponseHeaderLayer::overriding(
                DOCKER_DISTRIBUTION_API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Number of upload sessions currently tracked, including expired
    /// sessions not yet swept
    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Sweep expired uploads every configured GC interval until the handle
    /// is shut down or dropped
    pub fn spawn_gc(&self) -> GcHandle {
        let registry = self.clone();
        GcHandle::spawn(self.gc_interval, move || {
            let registry = registry.clone();
            async move {
                let reaped = registry.collect_expired_uploads().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "reaped expired uploads");
                }
            }
        })
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn read_body(body: Body, limit: usize) -> RegistryResult<Bytes> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|error| RegistryError::SizeInvalid(error.to_string()))
}

/// Route a `/v2/<name>/...` request to its handler
async fn dispatch(
    State(registry): State<Registry>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let Some(route) = OciRoute::parse(&path) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    validate_name(route.name())?;

    let body = match method {
        Method::PUT | Method::PATCH | Method::POST => read_body(body, registry.max_body).await?,
        _ => Bytes::new(),
    };

    let registry = &registry;
    match (method, route) {
        (Method::HEAD, OciRoute::Blob { digest, .. }) => blob::head_blob(registry, &digest).await,
        (Method::GET, OciRoute::Blob { digest, .. }) => blob::get_blob(registry, &digest).await,
        (Method::DELETE, OciRoute::Blob { digest, .. }) => blob::delete_blob(registry, &digest)
            .await
            .map(IntoResponse::into_response),

        (Method::POST, OciRoute::StartUpload { name }) => {
            blob::start_upload(registry, &name, &query, body).await
        }
        (Method::PATCH, OciRoute::Upload { name, id }) => {
            blob::upload_chunk(registry, &name, &id, &headers, body).await
        }
        (Method::PUT, OciRoute::Upload { name, id }) => {
            blob::complete_upload(registry, &name, &id, &query, body).await
        }
        (Method::GET, OciRoute::Upload { name, id }) => {
            blob::upload_status(registry, &name, &id).await
        }
        (Method::DELETE, OciRoute::Upload { name, id }) => blob::abort_upload(registry, &name, &id)
            .await
            .map(IntoResponse::into_response),
        (Method::PUT, OciRoute::MonolithicUpload { name, id }) => {
            blob::monolithic_upload(registry, &name, &id, &query, body).await
        }

        (Method::GET, OciRoute::Manifest { name, reference }) => {
            manifest::get_manifest(registry, &name, &reference).await
        }
        (Method::HEAD, OciRoute::Manifest { name, reference }) => {
            manifest::head_manifest(registry, &name, &reference).await
        }
        (Method::PUT, OciRoute::Manifest { name, reference }) => {
            manifest::put_manifest(registry, &name, &reference, &headers, body).await
        }
        (Method::DELETE, OciRoute::Manifest { name, reference }) => {
            manifest::delete_manifest(registry, &name, &reference)
                .await
                .map(IntoResponse::into_response)
        }

        (Method::GET, OciRoute::Referrers { name, digest }) => {
            manifest::referrers(registry, &name, &digest, &query).await
        }
        (Method::GET, OciRoute::Tags { name }) => manifest::list_tags(registry, &name, &query).await,

        (method, route) => Err(RegistryError::Unsupported(format!(
            "{method} on {}",
            route.name()
        ))),
    }
}
