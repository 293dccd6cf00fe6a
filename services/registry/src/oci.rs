//! OCI image-spec types the registry needs to understand.

use std::collections::BTreeMap;

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// `Docker-Content-Digest` response header.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
/// `Docker-Upload-UUID` response header.
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
/// `Docker-Distribution-API-Version` response header.
pub const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
/// `OCI-Subject` response header.
pub const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
/// `OCI-Filters-Applied` response header.
pub const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

/// Media types recognised in manifests.
pub mod media_type {
    /// OCI image manifest
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI empty JSON descriptor (`{}`)
    pub const OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";
    /// Docker image manifest, schema 2
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Untyped blob content
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// Digest of the two-byte `{}` blob used as an empty config.
pub const EMPTY_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// The kinds of manifest accepted on push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// A single image: config plus layers.
    Image,
    /// A list of platform-specific manifests.
    Index,
}

impl ManifestKind {
    /// Classify a manifest media type, or `None` when it is not accepted.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            media_type::OCI_MANIFEST | media_type::DOCKER_MANIFEST => Some(ManifestKind::Image),
            media_type::OCI_INDEX | media_type::DOCKER_MANIFEST_LIST => Some(ManifestKind::Index),
            _ => None,
        }
    }
}

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size in bytes of the referenced content.
    pub size: u64,
    /// Artifact type, for manifests that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Whether this is the well-known empty JSON descriptor.
    pub fn is_empty_config(&self) -> bool {
        self.media_type == media_type::OCI_EMPTY && self.digest.to_string() == EMPTY_DIGEST
    }
}

/// The subset of an image manifest or index needed to store and index it.
///
/// Both shapes are parsed into the same struct: `config` and `layers` are
/// populated for images and `manifests` for indexes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2 for accepted manifests.
    pub schema_version: u32,
    /// Embedded media type, when present.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Artifact type, when present.
    #[serde(default)]
    pub artifact_type: Option<String>,
    /// Image configuration blob.
    #[serde(default)]
    pub config: Option<Descriptor>,
    /// Image layers, in order.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Child manifests of an index.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// Manifest this one refers to.
    #[serde(default)]
    pub subject: Option<Descriptor>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// The artifact type used in referrer listings: the explicit
    /// `artifactType`, falling back to the config media type.
    pub fn effective_artifact_type(&self) -> Option<String> {
        self.artifact_type
            .clone()
            .or_else(|| self.config.as_ref().map(|c| c.media_type.clone()))
    }

    /// Every blob an image manifest requires to exist, config first.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        self.config
            .iter()
            .filter(|config| !config.is_empty_config())
            .chain(self.layers.iter())
    }
}

/// An OCI image index, as returned by the referrers API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Always the OCI index media type.
    pub media_type: String,
    /// Listed manifests.
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// An index listing `manifests`.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: media_type::OCI_INDEX.to_owned(),
            manifests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_is_hash_of_braces() {
        assert_eq!(Digest::compute(b"{}").to_string(), EMPTY_DIGEST);
    }

    #[test]
    fn parses_artifact_manifest() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_MANIFEST,
            "config": {
                "mediaType": media_type::OCI_EMPTY,
                "digest": EMPTY_DIGEST,
                "size": 2
            },
            "layers": [],
            "subject": {
                "mediaType": media_type::OCI_MANIFEST,
                "digest": Digest::compute(b"subject"),
                "size": 7
            },
            "artifactType": "application/vnd.example.sbom"
        });

        let manifest: Manifest = serde_json::from_value(body).unwrap();
        assert_eq!(manifest.blobs().count(), 0);
        assert_eq!(
            manifest.effective_artifact_type().as_deref(),
            Some("application/vnd.example.sbom")
        );
        assert!(manifest.subject.is_some());
    }

    #[test]
    fn artifact_type_falls_back_to_config() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.example.config",
                "digest": Digest::compute(b"config"),
                "size": 6
            },
            "layers": []
        });

        let manifest: Manifest = serde_json::from_value(body).unwrap();
        assert_eq!(
            manifest.effective_artifact_type().as_deref(),
            Some("application/vnd.example.config")
        );
        assert_eq!(manifest.blobs().count(), 1);
    }

    #[test]
    fn classifies_media_types() {
        assert_eq!(
            ManifestKind::from_media_type(media_type::DOCKER_MANIFEST_LIST),
            Some(ManifestKind::Index)
        );
        assert_eq!(ManifestKind::from_media_type("text/plain"), None);
    }
}
