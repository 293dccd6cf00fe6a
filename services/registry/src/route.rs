//! Parsing of `/v2/<name>/...` paths.
//!
//! Repository names may contain slashes, so the path cannot be matched by a
//! fixed route template. Instead the tail after `/v2/` is split at the last
//! occurrence of each API keyword.

use storage::UploadId;

use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// A distribution API endpoint, with the repository name still unvalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OciRoute {
    /// `/blobs/<digest>`
    Blob { name: String, digest: String },
    /// `/blobs/uploads/`
    StartUpload { name: String },
    /// `/blobs/uploads/<uuid>`
    Upload { name: String, id: UploadId },
    /// `/blobs/monolithic/upload/<uuid>`
    MonolithicUpload { name: String, id: UploadId },
    /// `/manifests/<reference>`
    Manifest { name: String, reference: String },
    /// `/referrers/<digest>`
    Referrers { name: String, digest: String },
    /// `/tags/list`
    Tags { name: String },
}

impl OciRoute {
    /// Match the part of the path after `/v2/`.
    pub(crate) fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');

        if let Some((name, id)) = split_last(path, "/blobs/monolithic/upload/") {
            return Some(OciRoute::MonolithicUpload {
                name,
                id: UploadId::from(id),
            });
        }

        if let Some(index) = path.rfind("/blobs/uploads/") {
            let name = &path[..index];
            let rest = &path[index + "/blobs/uploads/".len()..];
            if name.is_empty() || rest.contains('/') {
                return None;
            }
            if rest.is_empty() {
                return Some(OciRoute::StartUpload { name: name.into() });
            }
            return Some(OciRoute::Upload {
                name: name.into(),
                id: UploadId::from(rest),
            });
        }

        if let Some(name) = path.strip_suffix("/blobs/uploads") {
            if !name.is_empty() {
                return Some(OciRoute::StartUpload { name: name.into() });
            }
        }

        if let Some((name, digest)) = split_last(path, "/blobs/") {
            return Some(OciRoute::Blob { name, digest });
        }

        if let Some((name, digest)) = split_last(path, "/referrers/") {
            return Some(OciRoute::Referrers { name, digest });
        }

        if let Some(name) = path.strip_suffix("/tags/list") {
            if !name.is_empty() {
                return Some(OciRoute::Tags { name: name.into() });
            }
        }

        if let Some((name, reference)) = split_last(path, "/manifests/") {
            return Some(OciRoute::Manifest { name, reference });
        }

        None
    }

    /// The repository name this route addresses.
    pub(crate) fn name(&self) -> &str {
        match self {
            OciRoute::Blob { name, .. }
            | OciRoute::StartUpload { name }
            | OciRoute::Upload { name, .. }
            | OciRoute::MonolithicUpload { name, .. }
            | OciRoute::Manifest { name, .. }
            | OciRoute::Referrers { name, .. }
            | OciRoute::Tags { name } => name,
        }
    }
}

/// Split at the last `keyword`, requiring a non-empty name and a single
/// non-empty trailing segment.
fn split_last(path: &str, keyword: &str) -> Option<(String, String)> {
    let index = path.rfind(keyword)?;
    let name = &path[..index];
    let rest = &path[index + keyword.len()..];
    if name.is_empty() || rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some((name.to_owned(), rest.to_owned()))
}

/// Check a repository name against the distribution name grammar:
/// slash-separated components of lowercase alphanumerics joined by `.`, `_`,
/// `__` or runs of `-`.
pub(crate) fn validate_name(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.split('/').all(valid_component) {
        return Err(RegistryError::NameInvalid(name.to_owned()));
    }
    Ok(())
}

fn valid_component(component: &str) -> bool {
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = component.as_bytes();

    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) if alnum(first) && alnum(last) => {}
        _ => return false,
    }

    let mut index = 0;
    while index < bytes.len() {
        if alnum(&bytes[index]) {
            index += 1;
            continue;
        }

        let start = index;
        while index < bytes.len() && !alnum(&bytes[index]) {
            index += 1;
        }
        let separator = &component[start..index];
        let allowed = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !allowed {
            return false;
        }
    }

    true
}

/// Check a tag against `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub(crate) fn validate_tag(tag: &str) -> RegistryResult<()> {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut bytes = tag.bytes();
    let valid = tag.len() <= MAX_TAG_LEN
        && bytes.next().is_some_and(word)
        && bytes.all(|b| word(b) || b == b'.' || b == b'-');

    if !valid {
        return Err(RegistryError::TagInvalid(tag.to_owned()));
    }
    Ok(())
}
