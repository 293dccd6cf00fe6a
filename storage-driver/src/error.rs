use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// What went wrong in a backend call, independent of the backend.
///
/// The registry maps these onto protocol errors: `NotFound` becomes the
/// matching `*_UNKNOWN` code, `UploadUnknown` becomes `BLOB_UPLOAD_UNKNOWN`
/// and `TooManyParts` becomes `SIZE_INVALID`. Everything else is a 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The object or bucket does not exist.
    ///
    /// Some backends index metadata asynchronously, so a `NotFound` right
    /// after a write may clear up on retry.
    NotFound,

    /// Credentials were rejected.
    PermissionDenied,

    /// Network or disk failure.
    Io,

    /// The backend is overloaded or down.
    ServiceUnavailable,

    /// Credentials need refreshing.
    AuthExpired,

    /// The backend rejected the request as malformed.
    InvalidRequest,

    /// Bounded retry gave up.
    RetriesExhausted,

    /// A backend response could not be decoded.
    SerializationError,

    /// A part number above the backend's ceiling, or out of sequence.
    /// Logged as `ERR_TOO_MANY_PARTS`.
    TooManyParts,

    /// The multipart upload was never opened, or was completed, aborted or
    /// reclaimed by garbage collection.
    UploadUnknown,

    /// The call exceeded its configured timeout and was cancelled.
    Timeout,

    /// The backend cannot perform this operation, e.g. presigning.
    Unsupported,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Short label used in log lines and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageErrorKind::NotFound => "not found",
            StorageErrorKind::PermissionDenied => "permission denied",
            StorageErrorKind::Io => "I/O error",
            StorageErrorKind::ServiceUnavailable => "service unavailable",
            StorageErrorKind::AuthExpired => "authentication expired",
            StorageErrorKind::InvalidRequest => "invalid request",
            StorageErrorKind::RetriesExhausted => "retries exhausted",
            StorageErrorKind::SerializationError => "serialization error",
            StorageErrorKind::TooManyParts => "ERR_TOO_MANY_PARTS",
            StorageErrorKind::UploadUnknown => "upload unknown",
            StorageErrorKind::Timeout => "timed out",
            StorageErrorKind::Unsupported => "unsupported",
            StorageErrorKind::Other => "other error",
        }
    }

    /// Whether repeating the same call might succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable
                | StorageErrorKind::AuthExpired
                | StorageErrorKind::Timeout
                | StorageErrorKind::Io
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the backend an error happened.
#[derive(Debug, Default, Clone)]
struct Location {
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

/// Error from a storage backend.
///
/// Carries the engine name, a [`StorageErrorKind`], and where known the
/// bucket, object path and operation (`"s3: upload part"`), plus a backtrace
/// and the active tracing spans at the point of failure.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder("s3", StorageErrorKind::NotFound, "no such key")
///     .bucket("registry")
///     .path("blobs/sha256/abc")
///     .context("s3: head object")
///     .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// assert_eq!(error.path(), Some("blobs/sha256/abc"));
/// ```
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    location: Location,
    source: BoxError,
    backtrace: Box<Backtrace>,
    span_trace: SpanTrace,
}

impl fmt::Debug for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageError")
            .field("kind", &self.kind)
            .field("engine", &self.engine)
            .field("location", &self.location)
            .field("source", &self.source)
            .finish_non_exhaustive()?;
        write!(f, "\n{}", self.span_trace)
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    fn capture(kind: StorageErrorKind, engine: &'static str, location: Location, source: BoxError) -> Self {
        StorageError {
            kind,
            engine,
            location,
            source,
            backtrace: Box::new(Backtrace::capture()),
            span_trace: SpanTrace::capture(),
        }
    }

    /// An error with no location attached.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        StorageError::capture(kind, engine, Location::default(), error.into())
    }

    /// Start an error that will carry a bucket, path or operation context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<BoxError>,
    {
        StorageErrorBuilder {
            kind,
            engine,
            location: Location::default(),
            source: error.into(),
        }
    }

    /// A closure for `map_err`.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn open() -> Result<std::fs::File, StorageError> {
    ///     std::fs::File::open("blob").map_err(StorageError::with("local", StorageErrorKind::Io))
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<BoxError>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// No object at `path` in `bucket`.
    pub fn not_found(engine: &'static str, bucket: &str, path: impl Into<String>) -> Self {
        let path = path.into();
        let message = format!("no object at {path}");
        StorageError::builder(engine, StorageErrorKind::NotFound, message)
            .bucket(bucket)
            .path(path)
            .build()
    }

    /// The multipart upload `upload_id` is not open on this backend.
    pub fn upload_unknown(engine: &'static str, upload_id: &crate::UploadId) -> Self {
        StorageError::new(
            engine,
            StorageErrorKind::UploadUnknown,
            format!("no open upload {upload_id}"),
        )
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Name of the backend which failed.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Bucket involved, if any.
    pub fn bucket(&self) -> Option<&str> {
        self.location.bucket.as_deref()
    }

    /// Object path involved, if any.
    pub fn path(&self) -> Option<&str> {
        self.location.path.as_deref()
    }

    /// Operation context, if any.
    pub fn context(&self) -> Option<&str> {
        self.location.context.as_deref()
    }

    /// Replace the operation context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.location.context = Some(context.into());
        self
    }

    /// See [`StorageErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Backtrace captured when the error was created. Empty unless
    /// `RUST_BACKTRACE` is set.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Tracing spans active when the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.engine, self.kind)?;

        let Location {
            bucket,
            path,
            context,
        } = &self.location;
        match (bucket, path) {
            (Some(bucket), Some(path)) => write!(f, " at {bucket}/{path}")?,
            (Some(bucket), None) => write!(f, " in bucket {bucket}")?,
            (None, Some(path)) => write!(f, " at {path}")?,
            (None, None) => {}
        }
        if let Some(context) = context {
            write!(f, " ({context})")?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Adds location details to a [`StorageError`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    location: Location,
    source: BoxError,
}

impl StorageErrorBuilder {
    /// Bucket involved.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.location.bucket = Some(bucket.into());
        self
    }

    /// Object path involved.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.location.path = Some(path.into());
        self
    }

    /// Operation being performed.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.location.context = Some(context.into());
        self
    }

    /// Finish the error, capturing backtrace and spans here.
    pub fn build(self) -> StorageError {
        StorageError::capture(self.kind, self.engine, self.location, self.source)
    }
}
