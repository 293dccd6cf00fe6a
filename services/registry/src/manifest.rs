//! Manifest operations for the registry
//!
//! References resolve through the catalog: a reference that looks like a
//! digest is looked up directly, anything else is treated as a tag. Pushing a
//! manifest with a `subject` registers it in the referrers index of that
//! subject, which the referrers endpoint serves back as an OCI image index.

use std::collections::HashMap;

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::api::Registry;
use crate::catalog::ManifestRecord;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::oci::{
    DOCKER_CONTENT_DIGEST, ImageIndex, Manifest, ManifestKind, OCI_FILTERS_APPLIED, OCI_SUBJECT,
    media_type,
};
use crate::route::validate_tag;

/// A parsed manifest reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    Digest(Digest),
    Tag(String),
}

impl Reference {
    fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            Ok(Reference::Digest(Digest::parse(reference)?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_owned()))
        }
    }
}

/// Resolve a tag or digest to the stored manifest.
async fn resolve(registry: &Registry, name: &str, reference: &str) -> RegistryResult<ManifestRecord> {
    let unknown = || RegistryError::ManifestUnknown(format!("{name}:{reference}"));

    let digest = match Reference::parse(reference)? {
        Reference::Digest(digest) => digest,
        Reference::Tag(tag) => registry
            .catalog
            .resolve_tag(name, &tag)
            .await?
            .ok_or_else(unknown)?,
    };

    registry
        .catalog
        .get_manifest(name, &digest)
        .await?
        .ok_or_else(unknown)
}

fn manifest_headers(record: &ManifestRecord) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, record.media_type.clone()),
        (header::CONTENT_LENGTH, record.size.to_string()),
        (DOCKER_CONTENT_DIGEST, record.digest.to_string()),
    ]
}

/// Get a manifest
#[tracing::instrument(skip(registry))]
pub(crate) async fn get_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let record = resolve(registry, name, reference).await?;
    let data = registry
        .storage
        .get_manifest(&record.storage_link, reference)
        .await?;

    Ok((StatusCode::OK, manifest_headers(&record), data).into_response())
}

/// Check if a manifest exists
#[tracing::instrument(skip(registry))]
pub(crate) async fn head_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let record = resolve(registry, name, reference).await?;
    Ok((StatusCode::OK, manifest_headers(&record)).into_response())
}

/// Content type of the request, without parameters.
fn request_media_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
}

/// Put a manifest
#[tracing::instrument(skip(registry, headers, body), fields(size = body.len()))]
pub(crate) async fn put_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let declared = request_media_type(headers);
    if let Some(declared) = declared {
        if ManifestKind::from_media_type(declared).is_none() {
            return Err(RegistryError::UnsupportedMediaType(declared.to_owned()));
        }
    }

    let manifest: Manifest = serde_json::from_slice(&body)
        .map_err(|error| RegistryError::ManifestInvalid(error.to_string()))?;

    let media_type = declared
        .or(manifest.media_type.as_deref())
        .ok_or_else(|| RegistryError::ManifestInvalid("manifest media type is missing".to_owned()))?
        .to_owned();
    let kind = ManifestKind::from_media_type(&media_type)
        .ok_or_else(|| RegistryError::UnsupportedMediaType(media_type.clone()))?;

    if let Some(embedded) = &manifest.media_type {
        if *embedded != media_type {
            return Err(RegistryError::ManifestInvalid(format!(
                "mediaType {embedded} does not match content type {media_type}"
            )));
        }
    }
    if manifest.schema_version != 2 {
        return Err(RegistryError::ManifestInvalid(format!(
            "unsupported schemaVersion {}",
            manifest.schema_version
        )));
    }

    let digest = Digest::compute(&body);
    let tag = match Reference::parse(reference)? {
        Reference::Digest(claimed) if claimed != digest => {
            return Err(RegistryError::DigestMismatch {
                expected: claimed.to_string(),
                actual: digest,
            });
        }
        Reference::Digest(_) => None,
        Reference::Tag(tag) => Some(tag),
    };

    if kind == ManifestKind::Image {
        for blob in manifest.blobs() {
            if registry.catalog.get_layer(&blob.digest).await?.is_none() {
                return Err(RegistryError::ManifestBlobUnknown(blob.digest.clone()));
            }
        }
    }

    let storage_link = registry.storage.put_manifest(name, &digest, &body).await?;
    let subject = manifest.subject.clone();
    let record = ManifestRecord {
        namespace: name.to_owned(),
        digest: digest.clone(),
        media_type,
        schema_version: manifest.schema_version,
        size: body.len() as u64,
        artifact_type: manifest.effective_artifact_type(),
        layers: match kind {
            ManifestKind::Image => manifest.layers,
            ManifestKind::Index => manifest.manifests,
        },
        subject: subject.clone(),
        annotations: manifest.annotations,
        storage_link,
    };
    registry.catalog.put_manifest(record, tag.as_deref()).await?;
    tracing::debug!(%digest, tag = tag.as_deref(), "stored manifest");

    let mut response = (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response();

    if let Some(subject) = subject {
        if let Ok(value) = HeaderValue::from_str(&subject.digest.to_string()) {
            response.headers_mut().insert(OCI_SUBJECT, value);
        }
    }

    Ok(response)
}

/// Delete a manifest by digest, or untag it by tag
#[tracing::instrument(skip(registry))]
pub(crate) async fn delete_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<StatusCode> {
    let unknown = || RegistryError::ManifestUnknown(format!("{name}:{reference}"));

    match Reference::parse(reference)? {
        Reference::Digest(digest) => {
            let record = registry
                .catalog
                .delete_manifest(name, &digest)
                .await?
                .ok_or_else(unknown)?;
            registry.release(&record.storage_link).await?;
        }
        Reference::Tag(tag) => {
            if !registry.catalog.delete_tag(name, &tag).await? {
                return Err(unknown());
            }
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// List tags for a repository, paginated with `n` and `last`
#[tracing::instrument(skip(registry))]
pub(crate) async fn list_tags(
    registry: &Registry,
    name: &str,
    query: &HashMap<String, String>,
) -> RegistryResult<Response> {
    let page_size = query
        .get("n")
        .map(|n| n.parse::<usize>())
        .transpose()
        .map_err(|error| RegistryError::SizeInvalid(format!("invalid page size: {error}")))?;

    let mut tags = registry.catalog.list_tags(name).await?;
    if let Some(last) = query.get("last") {
        tags.retain(|tag| tag > last);
    }

    let mut next = None;
    if let Some(n) = page_size {
        if tags.len() > n {
            tags.truncate(n);
            if let Some(last) = tags.last() {
                next = Some(format!(
                    "</v2/{name}/tags/list?n={n}&last={last}>; rel=\"next\""
                ));
            }
        }
    }

    let mut response = Json(TagList {
        name: name.to_owned(),
        tags,
    })
    .into_response();

    if let Some(link) = next.and_then(|link| HeaderValue::from_str(&link).ok()) {
        response.headers_mut().insert(header::LINK, link);
    }

    Ok(response)
}

/// List manifests whose subject is `digest`, optionally filtered by artifact type
#[tracing::instrument(skip(registry))]
pub(crate) async fn referrers(
    registry: &Registry,
    name: &str,
    digest: &str,
    query: &HashMap<String, String>,
) -> RegistryResult<Response> {
    let subject = Digest::parse(digest)?;
    let mut manifests: Vec<_> = registry
        .catalog
        .referrers(name, &subject)
        .await?
        .iter()
        .map(ManifestRecord::descriptor)
        .collect();

    let filter = query.get("artifactType");
    if let Some(artifact_type) = filter {
        manifests.retain(|descriptor| descriptor.artifact_type.as_ref() == Some(artifact_type));
    }

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, media_type::OCI_INDEX)],
        Json(ImageIndex::new(manifests)),
    )
        .into_response();

    if filter.is_some() {
        response
            .headers_mut()
            .insert(OCI_FILTERS_APPLIED, HeaderValue::from_static("artifactType"));
    }

    Ok(response)
}
