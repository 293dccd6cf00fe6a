//! Registry metadata: which blobs exist, which manifests a repository holds,
//! where its tags point and which manifests refer to which subjects.
//!
//! The [`Catalog`] trait is the seam to a persistent database. The bundled
//! [`MemoryCatalog`] keeps everything in process, which suits tests and
//! single-node deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use storage::StorageLink;
use tokio::sync::RwLock;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::oci::Descriptor;

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    /// Content digest.
    pub digest: Digest,
    /// Media type, `application/octet-stream` unless known better.
    pub media_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Where the backend put the bytes.
    pub storage_link: StorageLink,
}

/// A stored manifest within one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Repository the manifest was pushed to.
    pub namespace: String,
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// Media type the manifest was pushed with.
    pub media_type: String,
    /// Manifest schema version.
    pub schema_version: u32,
    /// Size of the manifest bytes.
    pub size: u64,
    /// Layer descriptors, in manifest order.
    pub layers: Vec<Descriptor>,
    /// Descriptor of the manifest this one refers to.
    pub subject: Option<Descriptor>,
    /// Artifact type reported in referrer listings.
    pub artifact_type: Option<String>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
    /// Where the backend put the manifest bytes.
    pub storage_link: StorageLink,
}

impl ManifestRecord {
    /// Descriptor of this manifest, as listed in a referrers index.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            artifact_type: self.artifact_type.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

/// Metadata store for layers, manifests, tags and referrers.
///
/// Blobs are content-addressed and shared by every repository; manifests,
/// tags and referrers are scoped to a namespace.
#[async_trait]
pub trait Catalog: fmt::Debug + Send + Sync {
    /// Look up a layer by digest.
    async fn get_layer(&self, digest: &Digest) -> RegistryResult<Option<LayerRecord>>;

    /// Record a layer. An existing record for the same digest is kept, and
    /// `false` is returned.
    async fn put_layer(&self, layer: LayerRecord) -> RegistryResult<bool>;

    /// Forget a layer, returning the removed record.
    async fn delete_layer(&self, digest: &Digest) -> RegistryResult<Option<LayerRecord>>;

    /// Record a manifest, pointing `tag` at it when given, and index its subject.
    async fn put_manifest(&self, manifest: ManifestRecord, tag: Option<&str>)
    -> RegistryResult<()>;

    /// Look up a manifest by digest.
    async fn get_manifest(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<ManifestRecord>>;

    /// The digest a tag points to.
    async fn resolve_tag(&self, namespace: &str, tag: &str) -> RegistryResult<Option<Digest>>;

    /// Forget a manifest along with its tags and its referrers entry.
    async fn delete_manifest(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<ManifestRecord>>;

    /// Remove a tag, leaving the manifest in place.
    async fn delete_tag(&self, namespace: &str, tag: &str) -> RegistryResult<bool>;

    /// Tags of a repository in lexical order.
    async fn list_tags(&self, namespace: &str) -> RegistryResult<Vec<String>>;

    /// Manifests whose subject is `subject`, ordered by digest.
    async fn referrers(
        &self,
        namespace: &str,
        subject: &Digest,
    ) -> RegistryResult<Vec<ManifestRecord>>;

    /// Whether any layer or manifest record still points at `link`.
    ///
    /// Content-addressed backends hand out one link for identical bytes, so a
    /// link may outlive the record it was first stored for.
    async fn is_linked(&self, link: &StorageLink) -> RegistryResult<bool>;
}

type Scoped = (String, Digest);

#[derive(Debug, Default)]
struct Tables {
    layers: HashMap<Digest, LayerRecord>,
    manifests: HashMap<Scoped, ManifestRecord>,
    tags: HashMap<String, BTreeMap<String, Digest>>,
    referrers: HashMap<Scoped, BTreeSet<Digest>>,
}

/// In-process [`Catalog`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped(namespace: &str, digest: &Digest) -> Scoped {
    (namespace.to_owned(), digest.clone())
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_layer(&self, digest: &Digest) -> RegistryResult<Option<LayerRecord>> {
        Ok(self.tables.read().await.layers.get(digest).cloned())
    }

    async fn put_layer(&self, layer: LayerRecord) -> RegistryResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.layers.contains_key(&layer.digest) {
            return Ok(false);
        }
        tables.layers.insert(layer.digest.clone(), layer);
        Ok(true)
    }

    async fn delete_layer(&self, digest: &Digest) -> RegistryResult<Option<LayerRecord>> {
        Ok(self.tables.write().await.layers.remove(digest))
    }

    async fn put_manifest(
        &self,
        manifest: ManifestRecord,
        tag: Option<&str>,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.write().await;
        let key = scoped(&manifest.namespace, &manifest.digest);

        if let Some(tag) = tag {
            tables
                .tags
                .entry(manifest.namespace.clone())
                .or_default()
                .insert(tag.to_owned(), manifest.digest.clone());
        }

        if let Some(subject) = &manifest.subject {
            tables
                .referrers
                .entry(scoped(&manifest.namespace, &subject.digest))
                .or_default()
                .insert(manifest.digest.clone());
        }

        tables.manifests.entry(key).or_insert(manifest);
        Ok(())
    }

    async fn get_manifest(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<ManifestRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.manifests.get(&scoped(namespace, digest)).cloned())
    }

    async fn resolve_tag(&self, namespace: &str, tag: &str) -> RegistryResult<Option<Digest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .get(namespace)
            .and_then(|tags| tags.get(tag))
            .cloned())
    }

    async fn delete_manifest(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<ManifestRecord>> {
        let mut tables = self.tables.write().await;
        let Some(manifest) = tables.manifests.remove(&scoped(namespace, digest)) else {
            return Ok(None);
        };

        if let Some(tags) = tables.tags.get_mut(namespace) {
            tags.retain(|_, target| target != digest);
        }

        if let Some(subject) = &manifest.subject {
            let key = scoped(namespace, &subject.digest);
            if let Some(referrers) = tables.referrers.get_mut(&key) {
                referrers.remove(digest);
                if referrers.is_empty() {
                    tables.referrers.remove(&key);
                }
            }
        }

        Ok(Some(manifest))
    }

    async fn delete_tag(&self, namespace: &str, tag: &str) -> RegistryResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .tags
            .get_mut(namespace)
            .is_some_and(|tags| tags.remove(tag).is_some()))
    }

    async fn list_tags(&self, namespace: &str) -> RegistryResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .get(namespace)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn referrers(
        &self,
        namespace: &str,
        subject: &Digest,
    ) -> RegistryResult<Vec<ManifestRecord>> {
        let tables = self.tables.read().await;
        let Some(digests) = tables.referrers.get(&scoped(namespace, subject)) else {
            return Ok(Vec::new());
        };

        Ok(digests
            .iter()
            .filter_map(|digest| tables.manifests.get(&scoped(namespace, digest)))
            .cloned()
            .collect())
    }

    async fn is_linked(&self, link: &StorageLink) -> RegistryResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables.layers.values().any(|layer| &layer.storage_link == link)
            || tables
                .manifests
                .values()
                .any(|manifest| &manifest.storage_link == link))
    }
}
