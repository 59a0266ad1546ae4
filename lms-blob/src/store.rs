use async_trait::async_trait;
use bytes::Bytes;

use crate::{BlobResult, CompletedPart, UploadId};

/// Core object storage operations - must be implemented by all storage backends
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an object in one request, fully overwriting any existing object at `key`
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> BlobResult<PutResult>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Check whether an object exists
    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// List every object whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectSummary>>;

    /// Publicly resolvable URL for `key`
    fn public_url(&self, key: &str) -> String;

    /// Get store capabilities
    fn capabilities(&self) -> StoreCapabilities;
}

/// Multipart upload support
#[async_trait]
pub trait MultipartBlobStore: BlobStore {
    /// Initialize a multipart upload
    async fn init_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> BlobResult<UploadId>;

    /// Upload one part, returning its eTag
    async fn put_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> BlobResult<String>;

    /// Complete multipart upload; `parts` must be in increasing part-number order
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<PutResult>;

    /// Abort multipart upload and release the parts the backend holds
    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> BlobResult<()>;
}

/// Result of a successful put or multipart completion
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Location reported by the backend, if any
    pub location: Option<String>,
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size_bytes: u64,
    /// Unix seconds
    pub last_modified: Option<i64>,
}

/// Store capabilities
#[derive(Debug, Clone, Default)]
pub struct StoreCapabilities {
    pub supports_multipart: bool,
    /// Smallest allowed size of a non-final part
    pub min_part_size: Option<u64>,
    pub max_parts: Option<u32>,
}

impl StoreCapabilities {
    pub fn basic() -> Self {
        Self {
            supports_multipart: false,
            min_part_size: None,
            max_parts: None,
        }
    }

    pub fn with_multipart(mut self, min_part_size: Option<u64>, max_parts: Option<u32>) -> Self {
        self.supports_multipart = true;
        self.min_part_size = min_part_size;
        self.max_parts = max_parts;
        self
    }
}

/// Strategy for naming stored objects
pub trait KeyStrategy: Send + Sync {
    /// Key for a newly uploaded object
    fn object_key(&self, namespace: &str, original_name: &str) -> String;

    /// Whether every call yields a key no other upload can receive.
    ///
    /// Callers must check for an existing object before writing under a key
    /// from a strategy that returns `false`.
    fn unique_per_upload(&self) -> bool {
        false
    }
}

/// `{namespace}/{timestamp_ms}-{uuid}-{original filename}`.
///
/// Both the namespace and the unique prefix are optional: an empty namespace
/// drops the prefix, and `with_timestamp(false)` keeps the bare file name.
#[derive(Debug, Clone)]
pub struct NamespacedKeys {
    timestamp: bool,
}

impl NamespacedKeys {
    pub fn new() -> Self {
        Self { timestamp: true }
    }

    pub fn with_timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Default for NamespacedKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStrategy for NamespacedKeys {
    fn object_key(&self, namespace: &str, original_name: &str) -> String {
        let name = sanitize_file_name(original_name);
        let name = if self.timestamp {
            format!(
                "{}-{}-{}",
                chrono::Utc::now().timestamp_millis(),
                uuid::Uuid::new_v4().simple(),
                name
            )
        } else {
            name
        };

        let namespace = namespace.trim_matches('/');
        if namespace.is_empty() {
            name
        } else {
            format!("{}/{}", namespace, name)
        }
    }

    fn unique_per_upload(&self) -> bool {
        self.timestamp
    }
}

/// Keep the last path component and replace characters that are awkward in URLs
fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(original)
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_keys_prefix_and_timestamp() {
        let key = NamespacedKeys::new().object_key("Learning-Management-System", "intro.mp4");
        let (namespace, name) = key.split_once('/').unwrap();
        assert_eq!(namespace, "Learning-Management-System");
        let mut parts = name.splitn(3, '-');
        assert!(parts.next().unwrap().parse::<i64>().is_ok());
        assert!(uuid::Uuid::parse_str(parts.next().unwrap()).is_ok());
        assert_eq!(parts.next(), Some("intro.mp4"));
    }

    #[test]
    fn same_name_in_the_same_millisecond_gets_distinct_keys() {
        let keys = NamespacedKeys::new();
        assert!(keys.unique_per_upload());
        let first = keys.object_key("lms", "intro.mp4");
        let second = keys.object_key("lms", "intro.mp4");
        assert_ne!(first, second);
        assert!(!NamespacedKeys::new().with_timestamp(false).unique_per_upload());
    }

    #[test]
    fn namespace_and_timestamp_are_optional() {
        let keys = NamespacedKeys::new().with_timestamp(false);
        assert_eq!(keys.object_key("", "new.jpg"), "new.jpg");
        assert_eq!(keys.object_key("avatars/", "me.png"), "avatars/me.png");
    }

    #[test]
    fn file_names_are_sanitized() {
        let keys = NamespacedKeys::new().with_timestamp(false);
        assert_eq!(keys.object_key("ns", "../../etc/passwd"), "ns/passwd");
        assert_eq!(keys.object_key("ns", "my video (1).mp4"), "ns/my_video__1_.mp4");
        assert_eq!(keys.object_key("ns", "dir/"), "ns/file");
    }
}
