//! # lms-blob: object storage for course and profile media
//!
//! `lms-blob` moves media bytes into an S3-compatible bucket and hands back the
//! `{key, url}` [`ObjectReference`] that documents embed. It has no knowledge of
//! documents; keeping documents and storage consistent is `lms-media`'s job.
//!
//! ## Key Features
//!
//! - **Chunked uploads**: large lecture videos go through the multipart protocol
//!   in fixed-size parts, with bounded concurrent part transfer
//! - **Small-object path**: thumbnails and avatars below the threshold use one put
//! - **No dangling uploads**: an initiated multipart upload is completed or
//!   aborted exactly once, on failure and on cancellation
//! - **Storage agnostic**: S3-compatible backend plus an in-memory store with
//!   fault injection for development and tests
//!
//! ## Quick Start
//!
//! ```rust
//! use lms_blob::{BlobConfig, ByteSource, ChunkedUploader, MemoryBlobStore};
//!
//! # #[tokio::main]
//! # async fn main() -> lms_blob::BlobResult<()> {
//! let uploader = ChunkedUploader::new(MemoryBlobStore::new(), BlobConfig::default());
//!
//! let source = ByteSource::memory(b"thumbnail bytes".to_vec());
//! let reference = uploader.upload(&source, "courses/thumb.jpg", 15, Some("image/jpeg")).await?;
//! assert_eq!(reference.key, "courses/thumb.jpg");
//!
//! uploader.delete(&reference.key).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   lms-media         │  ← document/storage consistency
//! ├─────────────────────┤
//! │   ChunkedUploader   │  ← upload protocol, abort on failure
//! ├─────────────────────┤
//! │ MultipartBlobStore  │  ← storage primitives
//! └─────────────────────┘
//! ```

mod config;
mod error;
mod memory_store;
mod s3_store;
pub mod store;
mod types;
mod upload;
mod uploader;

// Re-export main types for clean API
pub use config::{BlobConfig, UploadRules};
pub use error::{BlobError, BlobResult};
pub use memory_store::{Fault, MemoryBlobStore, StoreOp};
pub use s3_store::{S3CompatibleStore, S3Config};
pub use store::{
    BlobStore, KeyStrategy, MultipartBlobStore, NamespacedKeys, ObjectSummary, PutResult,
    StoreCapabilities,
};
pub use types::{
    ByteSource, CompletedPart, ObjectReference, PartSpec, UploadId, UploadInput, UploadSession,
};
pub use upload::plan_parts;
pub use uploader::ChunkedUploader;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobConfig, BlobError, BlobResult, ByteSource, ChunkedUploader, MultipartBlobStore,
        ObjectReference, UploadInput,
    };
}
