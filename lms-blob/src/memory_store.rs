use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    BlobError, BlobResult, BlobStore, CompletedPart, MultipartBlobStore, ObjectSummary, PutResult,
    StoreCapabilities, UploadId,
};

/// Storage operations, for call counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Delete,
    Exists,
    List,
    InitMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

/// What an injected fault does to the call it hits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return a backend error without touching state
    Fail,
    /// Never return; the caller has to cancel
    Stall,
    /// Sleep, then perform the call normally
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: StoreOp,
    /// 1-based call number; `None` hits every call
    on_call: Option<usize>,
    fault: Fault,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    part_sizes: Vec<u64>,
    last_modified: i64,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    calls: HashMap<StoreOp, usize>,
    faults: Vec<FaultRule>,
}

/// In-process object store implementing the full multipart protocol.
///
/// Used for local development and tests. Completion checks part order and
/// eTags the way S3 does, every call is counted, and faults can be injected
/// per operation.
#[derive(Clone)]
pub struct MemoryBlobStore {
    base_url: String,
    state: Arc<Mutex<State>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_base_url("memory://media")
    }

    pub fn with_base_url<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Inject a fault on the `on_call`-th call (1-based) of `op`, or on every call
    pub fn inject(&self, op: StoreOp, on_call: Option<usize>, fault: Fault) {
        self.state.lock().faults.push(FaultRule { op, on_call, fault });
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// How many times `op` has been called
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).map(|o| o.body.clone())
    }

    /// Part sizes the object was assembled from; a single put yields one entry
    pub fn part_sizes(&self, key: &str) -> Option<Vec<u64>> {
        self.state.lock().objects.get(key).map(|o| o.part_sizes.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Multipart uploads initiated but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Seed an object directly, bypassing counters and faults
    pub fn insert<B: Into<Bytes>>(&self, key: &str, body: B) {
        let body = body.into();
        let size = body.len() as u64;
        self.state.lock().objects.insert(
            key.to_string(),
            StoredObject {
                body,
                part_sizes: vec![size],
                last_modified: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Backdate an object, for age-sensitive sweeps
    pub fn set_last_modified(&self, key: &str, unix_secs: i64) {
        if let Some(object) = self.state.lock().objects.get_mut(key) {
            object.last_modified = unix_secs;
        }
    }

    async fn enter(&self, op: StoreOp) -> BlobResult<()> {
        let fault = {
            let mut state = self.state.lock();
            let count = state.calls.entry(op).or_insert(0);
            *count += 1;
            let call = *count;
            state
                .faults
                .iter()
                .find(|rule| rule.op == op && rule.on_call.map_or(true, |n| n == call))
                .map(|rule| rule.fault)
        };

        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(BlobError::backend(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected {:?} failure", op),
            ))),
            Some(Fault::Stall) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Delay(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        _content_type: Option<&str>,
        body: Bytes,
    ) -> BlobResult<PutResult> {
        self.enter(StoreOp::Put).await?;
        let size = body.len() as u64;
        self.state.lock().objects.insert(
            key.to_string(),
            StoredObject {
                body,
                part_sizes: vec![size],
                last_modified: chrono::Utc::now().timestamp(),
            },
        );

        Ok(PutResult {
            location: Some(self.public_url(key)),
            etag: Some(Uuid::new_v4().simple().to_string()),
            size_bytes: size,
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.enter(StoreOp::Delete).await?;
        self.state.lock().objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        self.enter(StoreOp::Exists).await?;
        Ok(self.contains(key))
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectSummary>> {
        self.enter(StoreOp::List).await?;
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size_bytes: object.body.len() as u64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic().with_multipart(None, Some(10_000))
    }
}

#[async_trait]
impl MultipartBlobStore for MemoryBlobStore {
    async fn init_multipart(
        &self,
        key: &str,
        _content_type: Option<&str>,
    ) -> BlobResult<UploadId> {
        self.enter(StoreOp::InitMultipart).await?;
        let upload_id = UploadId::from_string(format!("mpu_{}", Uuid::new_v4().simple()));
        self.state.lock().uploads.insert(
            upload_id.to_string(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> BlobResult<String> {
        self.enter(StoreOp::UploadPart).await?;
        if part_number == 0 || part_number > 10_000 {
            return Err(BlobError::upload_failed(format!(
                "part number {} out of range",
                part_number
            )));
        }

        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id.as_str())
            .filter(|u| u.key == key)
            .ok_or_else(|| BlobError::not_found(format!("upload {} for {}", upload_id, key)))?;

        let etag = Uuid::new_v4().simple().to_string();
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<PutResult> {
        self.enter(StoreOp::CompleteMultipart).await?;
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get(upload_id.as_str())
            .filter(|u| u.key == key)
            .ok_or_else(|| BlobError::not_found(format!("upload {} for {}", upload_id, key)))?;

        if parts.is_empty() {
            return Err(BlobError::upload_failed("completion without parts"));
        }

        let mut body = BytesMut::new();
        let mut part_sizes = Vec::with_capacity(parts.len());
        let mut previous = 0u32;
        for part in &parts {
            if part.part_number <= previous {
                return Err(BlobError::upload_failed(format!(
                    "part {} listed after part {}",
                    part.part_number, previous
                )));
            }
            previous = part.part_number;

            let (etag, bytes) = upload.parts.get(&part.part_number).ok_or_else(|| {
                BlobError::upload_failed(format!("part {} was never uploaded", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(BlobError::upload_failed(format!(
                    "eTag mismatch for part {}",
                    part.part_number
                )));
            }
            body.extend_from_slice(bytes);
            part_sizes.push(bytes.len() as u64);
        }

        let size = body.len() as u64;
        state.uploads.remove(upload_id.as_str());
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body: body.freeze(),
                part_sizes,
                last_modified: chrono::Utc::now().timestamp(),
            },
        );

        Ok(PutResult {
            location: Some(self.public_url(key)),
            etag: Some(format!("{}-{}", Uuid::new_v4().simple(), parts.len())),
            size_bytes: size,
        })
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> BlobResult<()> {
        self.enter(StoreOp::AbortMultipart).await?;
        let mut state = self.state.lock();
        let owned = state
            .uploads
            .get(upload_id.as_str())
            .map_or(false, |u| u.key == key);
        if !owned {
            return Err(BlobError::not_found(format!("upload {} for {}", upload_id, key)));
        }
        state.uploads.remove(upload_id.as_str());
        Ok(())
    }
}
