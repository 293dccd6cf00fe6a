//! # Storage driver contract
//!
//! The capability set every registry storage backend implements: whole-object
//! upload and download, metadata, listing, multipart sessions and presigned
//! reads.

mod driver;
mod error;

pub use driver::check_part_number;
pub use driver::check_part_sequence;
pub use driver::CompletedPart;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::StorageLink;
pub use driver::UploadId;
pub use driver::UploadProgress;
pub use driver::Writer;
pub use driver::DEFAULT_MAX_PARTS;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
