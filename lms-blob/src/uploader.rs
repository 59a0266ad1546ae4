use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    plan_parts, BlobConfig, BlobError, BlobResult, ByteSource, MultipartBlobStore,
    ObjectReference, PartSpec, PutResult, UploadId, UploadSession,
};

/// Drives the upload protocol against a storage backend and hands back an
/// [`ObjectReference`]. Knows nothing about documents.
///
/// Objects below `multipart_threshold_bytes` go out in a single put; larger
/// ones are initiated, sent in `part_size` parts with bounded fan-out, and
/// completed with the ordered part list. Once a multipart upload has been
/// initiated it is either completed or aborted exactly once, including when
/// the returned future is dropped.
pub struct ChunkedUploader {
    store: Arc<dyn MultipartBlobStore>,
    config: BlobConfig,
}

impl ChunkedUploader {
    pub fn new<S: MultipartBlobStore + 'static>(store: S, config: BlobConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Share one process-wide store client between uploaders
    pub fn from_shared(store: Arc<dyn MultipartBlobStore>, config: BlobConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn MultipartBlobStore> {
        &self.store
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Upload `total_size` bytes from `source` to `key`.
    #[instrument(skip_all, fields(key = %key, total_size = total_size))]
    pub async fn upload(
        &self,
        source: &ByteSource,
        key: &str,
        total_size: u64,
        content_type: Option<&str>,
    ) -> BlobResult<ObjectReference> {
        self.check_input(source, key, total_size).await?;

        let result = if total_size < self.config.multipart_threshold_bytes {
            self.put_single(source, key, total_size, content_type).await?
        } else {
            self.put_multipart(source, key, total_size, content_type).await?
        };

        let url = result
            .location
            .filter(|location| !location.is_empty())
            .unwrap_or_else(|| self.store.public_url(key));

        info!("Uploaded {} ({} bytes)", key, result.size_bytes);
        Ok(ObjectReference::new(key, url))
    }

    /// Delete the object at `key`. An empty key refers to no object.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &str) -> BlobResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.store.delete(key).await?;
        debug!("Deleted {}", key);
        Ok(())
    }

    async fn check_input(&self, source: &ByteSource, key: &str, total_size: u64) -> BlobResult<()> {
        if key.is_empty() {
            return Err(BlobError::invalid("object key is empty"));
        }
        if total_size == 0 {
            return Err(BlobError::invalid("cannot upload an empty object"));
        }
        if total_size > self.config.max_blob_bytes {
            return Err(BlobError::invalid(format!(
                "object size {} exceeds maximum {}",
                total_size, self.config.max_blob_bytes
            )));
        }

        let actual = match source.len().await {
            Ok(len) => len,
            Err(BlobError::Io { source: io }) if io.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::invalid("upload source file is missing"));
            }
            Err(e) => return Err(e),
        };
        if actual != total_size {
            return Err(BlobError::invalid(format!(
                "declared size {} does not match source size {}",
                total_size, actual
            )));
        }
        Ok(())
    }

    async fn put_single(
        &self,
        source: &ByteSource,
        key: &str,
        total_size: u64,
        content_type: Option<&str>,
    ) -> BlobResult<PutResult> {
        let body = source.read_range(0, total_size).await?;
        self.store.put(key, content_type, body).await
    }

    async fn put_multipart(
        &self,
        source: &ByteSource,
        key: &str,
        total_size: u64,
        content_type: Option<&str>,
    ) -> BlobResult<PutResult> {
        let rules = &self.config.upload_rules;
        let plan = plan_parts(total_size, rules.part_size)?;

        let capabilities = self.store.capabilities();
        let max_parts = capabilities
            .max_parts
            .map_or(rules.max_parts, |store_max| store_max.min(rules.max_parts));
        if plan.len() > max_parts as usize {
            return Err(BlobError::invalid(format!(
                "{} parts exceeds the limit of {}",
                plan.len(),
                max_parts
            )));
        }
        if let Some(min) = capabilities.min_part_size {
            if plan.len() > 1 && rules.part_size < min {
                return Err(BlobError::invalid(format!(
                    "part size {} is below the store minimum {}",
                    rules.part_size, min
                )));
            }
        }

        let upload_id = self.store.init_multipart(key, content_type).await?;
        let mut guard = AbortGuard::new(self.store.clone(), key, upload_id.clone());
        let mut session = UploadSession::new(upload_id.clone(), key.to_string(), rules.part_size);
        debug!("Initiated multipart upload {} with {} parts", upload_id, plan.len());

        let outcome = match self.send_parts(source, &mut session, plan).await {
            Ok(()) => {
                self.store
                    .complete_multipart(key, &upload_id, session.ordered_parts())
                    .await
            }
            Err(e) => Err(e),
        };

        // From here on the upload is either completed or explicitly aborted below
        guard.disarm();
        match outcome {
            Ok(result) => {
                debug!(
                    "Completed multipart upload {} ({} parts, {} bytes)",
                    upload_id,
                    session.part_count(),
                    session.bytes_sent
                );
                Ok(result)
            }
            Err(err) => {
                warn!("Multipart upload {} for {} failed: {}", upload_id, key, err);
                if let Err(abort_err) = self.store.abort_multipart(key, &upload_id).await {
                    error!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                Err(err)
            }
        }
    }

    /// Upload every planned part, at most `max_concurrent_parts` at a time
    async fn send_parts(
        &self,
        source: &ByteSource,
        session: &mut UploadSession,
        plan: Vec<PartSpec>,
    ) -> BlobResult<()> {
        let store = &self.store;
        let key = session.key.clone();
        let upload_id = session.upload_id.clone();
        let key = key.as_str();
        let upload_id = &upload_id;

        let mut in_flight = futures::stream::iter(plan)
            .map(|part| async move {
                let body = source.read_range(part.offset, part.len).await?;
                let etag = store.put_part(key, upload_id, part.part_number, body).await?;
                Ok::<_, BlobError>((part, etag))
            })
            .buffer_unordered(self.config.upload_rules.max_concurrent_parts.max(1));

        while let Some(result) = in_flight.next().await {
            let (part, etag) = result?;
            session.record_part(&part, etag)?;
        }
        Ok(())
    }
}

/// Aborts an initiated multipart upload if dropped while still armed.
///
/// Covers cancellation: dropping the upload future mid-transfer leaves no
/// initiated-but-unfinished upload behind.
struct AbortGuard {
    store: Option<Arc<dyn MultipartBlobStore>>,
    key: String,
    upload_id: UploadId,
}

impl AbortGuard {
    fn new(store: Arc<dyn MultipartBlobStore>, key: &str, upload_id: UploadId) -> Self {
        Self {
            store: Some(store),
            key: key.to_string(),
            upload_id,
        }
    }

    fn disarm(&mut self) {
        self.store = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let upload_id = self.upload_id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Multipart upload {} for {} cancelled, aborting", upload_id, key);
                handle.spawn(async move {
                    if let Err(e) = store.abort_multipart(&key, &upload_id).await {
                        error!("Failed to abort cancelled upload {}: {}", upload_id, e);
                    }
                });
            }
            Err(_) => {
                error!(
                    "Multipart upload {} for {} dropped outside a runtime; left for the backend's idle-abort rule",
                    upload_id, key
                );
            }
        }
    }
}
