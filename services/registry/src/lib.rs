//! # OCI Container Registry
//!
//! This crate implements an OCI-compliant container registry server following
//! the [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Monolithic, POST+PUT and chunked (PATCH+PUT) blob uploads with
//!   `Content-Range` continuity checks and full-content digest verification
//! - Manifest push, pull and delete by tag or digest, with tag pagination
//! - The referrers API, indexed from each manifest's `subject`
//! - Pluggable storage via the `storage` crate (memory, local disk, S3, IPFS)
//! - Pluggable metadata via the [`Catalog`] trait
//! - Idle uploads expire and are garbage collected in the background
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .finish();
//!
//! let _gc = registry.spawn_gc();
//! let app = registry.router();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod catalog;
pub mod digest;
mod error;
mod manifest;
pub mod oci;
mod route;
mod storage;

pub use api::{
    DEFAULT_BUCKET, DEFAULT_MAX_BODY, DEFAULT_PRESIGN_EXPIRY, Registry, RegistryBuilder,
};
pub use catalog::{Catalog, LayerRecord, ManifestRecord, MemoryCatalog};
pub use digest::{Digest, DigestError, DigestWriter};
pub use error::{RegistryError, RegistryResult};
