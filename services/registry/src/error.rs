//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage::{StorageError, StorageErrorKind};

use crate::digest::{Digest, DigestError};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
///
/// Each variant corresponds to one error code of the distribution API and is
/// rendered as the standard `{"errors": [...]}` body.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not known to the registry
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Upload state is invalid for the request
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Upload session does not exist or has expired
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Content-Range does not continue the upload
    #[error("requested range not satisfiable: {0}")]
    RangeInvalid(String),

    /// Malformed digest
    #[error("provided digest did not match uploaded content: {0}")]
    DigestInvalid(String),

    /// Uploaded content does not hash to the claimed digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest claimed by the client
        expected: String,
        /// Digest of the received content
        actual: Digest,
    },

    /// Manifest references a blob that has not been pushed
    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(Digest),

    /// Manifest body cannot be parsed
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Manifest not known to the registry
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// Repository name does not match the name grammar
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Repository not known to the registry
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Content size does not match what was declared
    #[error("provided length did not match content length: {0}")]
    SizeInvalid(String),

    /// Tag does not match the tag grammar
    #[error("manifest tag did not match URI: {0}")]
    TagInvalid(String),

    /// Authentication required
    #[error("authentication required")]
    Unauthorized,

    /// Access denied
    #[error("requested access to the resource is denied")]
    Denied,

    /// Manifest media type is not accepted
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    /// Operation is not supported
    #[error("the operation is unsupported: {0}")]
    Unsupported(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for RegistryError {
    fn from(error: StorageError) -> Self {
        match error.kind() {
            StorageErrorKind::UploadUnknown => {
                RegistryError::BlobUploadUnknown(error.to_string())
            }
            StorageErrorKind::TooManyParts => RegistryError::SizeInvalid(error.to_string()),
            _ => RegistryError::Storage(error),
        }
    }
}

impl From<DigestError> for RegistryError {
    fn from(error: DigestError) -> Self {
        RegistryError::DigestInvalid(error.to_string())
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::NameUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::BlobUploadInvalid(_)
            | RegistryError::DigestInvalid(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::ManifestInvalid(_)
            | RegistryError::NameInvalid(_)
            | RegistryError::SizeInvalid(_)
            | RegistryError::TagInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeInvalid(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Denied => StatusCode::FORBIDDEN,
            RegistryError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadInvalid(_) | RegistryError::RangeInvalid(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::DigestInvalid(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestInvalid(_) => "MANIFEST_INVALID",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::SizeInvalid(_) => "SIZE_INVALID",
            RegistryError::TagInvalid(_) => "TAG_INVALID",
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::Denied => "DENIED",
            RegistryError::UnsupportedMediaType(_) | RegistryError::Unsupported(_) => {
                "UNSUPPORTED"
            }
            RegistryError::Storage(_) => "UNKNOWN",
        }
    }

    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            RegistryError::DigestMismatch { expected, actual } => Some(serde_json::json!({
                "expected": expected,
                "actual": actual,
            })),
            RegistryError::ManifestBlobUnknown(digest) => {
                Some(serde_json::json!({ "digest": digest }))
            }
            _ => None,
        }
    }
}

/// Convert storage `NotFound` errors into the matching `*_UNKNOWN` error.
pub(crate) trait StorageResultExt<T> {
    fn or_unknown<F>(self, unknown: F) -> RegistryResult<T>
    where
        F: FnOnce() -> RegistryError;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn or_unknown<F>(self, unknown: F) -> RegistryResult<T>
    where
        F: FnOnce() -> RegistryError,
    {
        self.map_err(|error| match error.kind() {
            StorageErrorKind::NotFound => unknown(),
            _ => error.into(),
        })
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::debug!(code = self.error_code(), "{self}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kinds_map_to_codes() {
        let unknown: RegistryError =
            StorageError::with("memory", StorageErrorKind::UploadUnknown)("gone").into();
        assert_eq!(unknown.error_code(), "BLOB_UPLOAD_UNKNOWN");
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);

        let parts: RegistryError =
            StorageError::with("s3", StorageErrorKind::TooManyParts)("10001").into();
        assert_eq!(parts.error_code(), "SIZE_INVALID");

        let io: RegistryError = StorageError::with("local", StorageErrorKind::Io)("disk").into();
        assert_eq!(io.error_code(), "UNKNOWN");
        assert_eq!(io.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn not_found_becomes_unknown() {
        let missing: Result<(), StorageError> =
            Err(StorageError::with("memory", StorageErrorKind::NotFound)("missing"));
        let error = missing
            .or_unknown(|| RegistryError::BlobUnknown("sha256:00".into()))
            .unwrap_err();
        assert_eq!(error.error_code(), "BLOB_UNKNOWN");
    }

    #[test]
    fn unsupported_statuses() {
        assert_eq!(
            RegistryError::UnsupportedMediaType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            RegistryError::Unsupported("PATCH".into()).status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            RegistryError::RangeInvalid("0-3".into()).status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }
}
