use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{BlobError, BlobResult};

/// The `{key, url}` pair a document stores to address a blob.
///
/// `key` is the canonical storage address; an empty key means "no object".
/// Field names match what the document store already persists
/// (`public_id` / `secure_url`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(rename = "public_id", default)]
    pub key: String,
    #[serde(rename = "secure_url", default)]
    pub url: String,
}

impl ObjectReference {
    pub fn new<K: Into<String>, U: Into<String>>(key: K, url: U) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
        }
    }

    /// A reference that points at nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Backend-assigned identifier for a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One slice of the source, as planned before any bytes move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Part number plus the integrity tag the backend returned for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Process-local state of one multipart upload. Never persisted.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub key: String,
    pub part_size: u64,
    pub parts: BTreeMap<u32, CompletedPart>,
    pub bytes_sent: u64,
    pub started_at: i64,
}

impl UploadSession {
    pub fn new(upload_id: UploadId, key: String, part_size: u64) -> Self {
        Self {
            upload_id,
            key,
            part_size,
            parts: BTreeMap::new(),
            bytes_sent: 0,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Record a finished part. Recording the same part twice is a protocol error.
    pub fn record_part(&mut self, spec: &PartSpec, etag: String) -> BlobResult<()> {
        if self.parts.contains_key(&spec.part_number) {
            return Err(BlobError::upload_failed(format!(
                "part {} of upload {} recorded twice",
                spec.part_number, self.upload_id
            )));
        }
        self.parts.insert(
            spec.part_number,
            CompletedPart {
                part_number: spec.part_number,
                etag,
            },
        );
        self.bytes_sent += spec.len;
        Ok(())
    }

    /// Parts in strictly increasing part-number order, as completion requires
    pub fn ordered_parts(&self) -> Vec<CompletedPart> {
        self.parts.values().cloned().collect()
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
pub enum ByteSource {
    /// A file on local disk (e.g. a spooled request body)
    File(PathBuf),
    /// Bytes already in memory
    Memory(Bytes),
}

impl ByteSource {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(path.into())
    }

    pub fn memory<B: Into<Bytes>>(bytes: B) -> Self {
        Self::Memory(bytes.into())
    }

    /// Actual size of the source in bytes
    pub async fn len(&self) -> BlobResult<u64> {
        match self {
            Self::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Every call opens its own file handle so parts can be read concurrently.
    pub async fn read_range(&self, offset: u64, len: u64) -> BlobResult<Bytes> {
        match self {
            Self::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Self::Memory(bytes) => {
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= bytes.len() as u64)
                    .ok_or_else(|| {
                        BlobError::invalid(format!(
                            "range {}+{} outside source of {} bytes",
                            offset,
                            len,
                            bytes.len()
                        ))
                    })?;
                Ok(bytes.slice(offset as usize..end as usize))
            }
        }
    }
}

/// Validated description of media handed in by the HTTP layer
#[derive(Debug, Clone)]
pub struct UploadInput {
    pub source: ByteSource,
    pub declared_size: u64,
    pub original_name: String,
    pub content_type: Option<String>,
}

impl UploadInput {
    pub fn new<S: Into<String>>(source: ByteSource, declared_size: u64, original_name: S) -> Self {
        Self {
            source,
            declared_size,
            original_name: original_name.into(),
            content_type: None,
        }
    }

    /// In-memory input whose declared size is the buffer length
    pub fn from_bytes<S: Into<String>, B: Into<Bytes>>(original_name: S, bytes: B) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        Self::new(ByteSource::Memory(bytes), size, original_name)
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Boundary checks that must pass before the core touches storage
    pub fn validate(&self) -> BlobResult<()> {
        if self.declared_size == 0 {
            return Err(BlobError::invalid("upload body is empty"));
        }
        if self.original_name.trim().is_empty() {
            return Err(BlobError::invalid("upload is missing a file name"));
        }
        Ok(())
    }
}
