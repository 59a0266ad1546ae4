//! # lms-media: media lifecycle for course and profile documents
//!
//! Course thumbnails, lecture videos and user avatars live in object storage
//! and are referenced from documents by `{key, url}`. [`MediaCoordinator`]
//! sequences uploads, document writes and deletes so that a document never
//! references an object that does not exist.
//!
//! ```rust
//! use std::sync::Arc;
//! use lms_blob::{BlobConfig, ChunkedUploader, MemoryBlobStore, UploadInput};
//! use lms_media::{Course, MediaConfig, MediaCoordinator, MediaField, MemoryDocumentStore};
//!
//! # #[tokio::main]
//! # async fn main() -> lms_media::MediaResult<()> {
//! let uploader = Arc::new(ChunkedUploader::new(MemoryBlobStore::new(), BlobConfig::default()));
//! let courses = MemoryDocumentStore::<Course>::new();
//! let course = Course::new("Rust", "Systems programming", "Programming", "admin");
//! courses.insert(&course).expect("seed course");
//!
//! let coordinator = MediaCoordinator::<Course>::new(uploader, Arc::new(courses.clone()), MediaConfig::default());
//! let thumbnail = coordinator
//!     .attach(&course.id, MediaField::Thumbnail, UploadInput::from_bytes("cover.jpg", vec![0u8; 64]))
//!     .await?;
//! assert!(thumbnail.key.starts_with("Learning-Management-System/"));
//! # Ok(())
//! # }
//! ```
//!
//! Failures after an upload has completed never delete the uploaded object.
//! They leave an orphan in the [`OrphanLedger`], which [`OrphanSweeper`]
//! reconciles out of band.

mod config;
mod coordinator;
mod document;
mod error;
mod model;
mod policy;

pub use config::{MediaConfig, DEFAULT_AVATAR_NAMESPACE, DEFAULT_NAMESPACE};
pub use coordinator::{LectureDraft, MediaCoordinator, OperationState, ReleaseOutcome};
pub use document::{DocOp, DocumentStore, MemoryDocumentStore};
pub use error::{ErrorKind, MediaError, MediaResult};
pub use model::{Course, DocumentId, Lecture, LectureId, MediaDocument, MediaField, User};
pub use policy::{
    CleanupPolicy, MemoryOrphanLedger, OrphanLedger, OrphanReason, OrphanRecord, OrphanSweeper,
    RetryPolicy, SweepReport,
};
