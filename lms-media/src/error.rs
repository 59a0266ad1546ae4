//! # Errors
//!
//! Every failure the media lifecycle surfaces to its caller, classified the
//! way the HTTP layer renders it:
//! - `InvalidInput` and `NotFound` are detected before anything is written
//! - `StorageFailure` means the storage backend refused an upload
//! - `PersistFailure` means the document store refused a write
//!
//! Orphaned objects are not errors. They are recorded in the orphan ledger.

use lms_blob::BlobError;
use serde_json::json;
use thiserror::Error;

pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Status classification for the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,   // 400
    NotFound,     // 404
    GeneralError, // 500
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::GeneralError => 500,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::GeneralError => "GeneralError",
        }
    }

    /// Kebab-cased class name
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotFound => "not-found",
            ErrorKind::GeneralError => "general-error",
        }
    }
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Storage failure: {source}")]
    StorageFailure {
        #[source]
        source: BlobError,
    },

    #[error("Persist failure: {source}")]
    PersistFailure {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl MediaError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Wrap a document store error
    pub fn persist(err: anyhow::Error) -> Self {
        Self::PersistFailure {
            source: err.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::InvalidInput { .. } => ErrorKind::BadRequest,
            MediaError::NotFound { .. } => ErrorKind::NotFound,
            MediaError::StorageFailure { .. } | MediaError::PersistFailure { .. } => {
                ErrorKind::GeneralError
            }
        }
    }

    pub fn code(&self) -> u16 {
        self.kind().status_code()
    }

    /// JSON payload for the HTTP layer. Sources are left out; they may carry
    /// backend details.
    pub fn to_json(&self) -> serde_json::Value {
        let kind = self.kind();
        json!({
            "name": kind.name(),
            "message": self.to_string(),
            "code": kind.status_code(),
            "className": kind.class_name(),
        })
    }
}

/// Input rejected by the upload layer stays an input error; anything else
/// from storage is a storage failure.
impl From<BlobError> for MediaError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Invalid { message } => MediaError::InvalidInput { message },
            other => MediaError::StorageFailure { source: other },
        }
    }
}
