//! Storage layer for the registry

use bytes::Bytes;
use camino::Utf8PathBuf;
use storage::{StorageBucket, StorageErrorKind, StorageLink, UploadId};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult, StorageResultExt};

/// Registry view of the storage backend.
///
/// Objects are laid out as:
///
/// * `blobs/<algorithm>/<hex>` for blobs pushed in one request,
/// * `uploads/<namespace>/<uuid>` for blobs assembled from chunks,
/// * `manifests/<namespace>/<algorithm>/<hex>` for manifest bytes.
///
/// Blobs are always read back through the link recorded in the catalog, so
/// the two blob layouts can coexist.
#[derive(Clone, Debug)]
pub(crate) struct RegistryStorage {
    bucket: StorageBucket,
}

impl RegistryStorage {
    /// Create a new registry storage
    pub(crate) fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    pub(crate) fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    /// Get the path for a blob
    pub(crate) fn blob_path(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("blobs/{}/{}", digest.algorithm(), digest.hex()))
    }

    /// Get the path for a chunked upload target
    pub(crate) fn upload_path(namespace: &str, id: &UploadId) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("uploads/{namespace}/{id}"))
    }

    /// Get the path for a manifest
    pub(crate) fn manifest_path(namespace: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "manifests/{namespace}/{}/{}",
            digest.algorithm(),
            digest.hex()
        ))
    }

    /// Store a verified blob in one request
    pub(crate) async fn put_blob(&self, digest: &Digest, data: &[u8]) -> RegistryResult<StorageLink> {
        let path = Self::blob_path(digest);
        Ok(self.bucket.upload_bytes(&path, data).await?)
    }

    /// Store manifest bytes
    pub(crate) async fn put_manifest(
        &self,
        namespace: &str,
        digest: &Digest,
        data: &[u8],
    ) -> RegistryResult<StorageLink> {
        let path = Self::manifest_path(namespace, digest);
        Ok(self.bucket.upload_bytes(&path, data).await?)
    }

    /// Read manifest bytes back
    pub(crate) async fn get_manifest(&self, link: &StorageLink, reference: &str) -> RegistryResult<Bytes> {
        self.bucket
            .download_bytes(link)
            .await
            .or_unknown(|| RegistryError::ManifestUnknown(reference.to_owned()))
    }

    /// Delete an object, treating an already missing object as deleted
    pub(crate) async fn remove(&self, link: &StorageLink) -> RegistryResult<()> {
        match self.bucket.delete(link).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == StorageErrorKind::NotFound => {
                tracing::debug!(%link, "object already removed");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryStorage, Storage};

    fn storage() -> RegistryStorage {
        let storage = Storage::new(MemoryStorage::with_buckets(&["registry"]));
        RegistryStorage::new(storage.bucket("registry"))
    }

    #[test]
    fn layout() {
        let digest = Digest::compute(b"AAAA");
        assert_eq!(
            RegistryStorage::blob_path(&digest),
            format!("blobs/sha256/{}", digest.hex())
        );
        assert_eq!(
            RegistryStorage::manifest_path("alice/app", &digest),
            format!("manifests/alice/app/sha256/{}", digest.hex())
        );
        assert_eq!(
            RegistryStorage::upload_path("alice/app", &UploadId::from("1234")),
            "uploads/alice/app/1234"
        );
    }

    #[tokio::test]
    async fn manifest_round_trip() {
        let storage = storage();
        let digest = Digest::compute(b"{}");

        let link = storage.put_manifest("app", &digest, b"{}").await.unwrap();
        let data = storage.get_manifest(&link, "latest").await.unwrap();
        assert_eq!(&data[..], b"{}");

        storage.remove(&link).await.unwrap();
        storage.remove(&link).await.unwrap();

        let err = storage.get_manifest(&link, "latest").await.unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_UNKNOWN");
    }
}
