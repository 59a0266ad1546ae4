use std::fmt;
use std::sync::Arc;

use lms_blob::{BlobStore, ChunkedUploader, KeyStrategy, NamespacedKeys, ObjectReference, UploadInput};
use tracing::{debug, info, instrument, warn};

use crate::{
    CleanupPolicy, Course, DocumentId, DocumentStore, Lecture, LectureId, MediaConfig,
    MediaDocument, MediaError, MediaField, MediaResult, MemoryOrphanLedger, OrphanLedger,
    OrphanReason, OrphanRecord,
};

/// Where a lifecycle operation is. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Start,
    StorageOp,
    DocumentPersist,
    StorageCleanup,
    Done,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            OperationState::Start => "start",
            OperationState::StorageOp => "storage_op",
            OperationState::DocumentPersist => "document_persist",
            OperationState::StorageCleanup => "storage_cleanup",
            OperationState::Done => "done",
            OperationState::Failed => "failed",
        };
        f.write_str(state)
    }
}

/// Title and description of a lecture being added to a course
#[derive(Debug, Clone)]
pub struct LectureDraft {
    pub title: String,
    pub description: String,
}

impl LectureDraft {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// What a release did to storage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub deleted: Vec<String>,
    /// Keys whose delete failed; recorded in the orphan ledger
    pub orphaned: Vec<String>,
}

/// Keeps documents and the storage objects they reference consistent.
///
/// Ordering rules:
/// - attach and replace upload first and only then write the document, so a
///   document never points at an object that does not exist
/// - replace deletes the superseded object only after the new reference is
///   persisted; a failed delete leaves an orphan, never a dangling reference
/// - release deletes storage first, then removes the owning record
///
/// Each operation makes at most one document write. No locking is done
/// across operations; concurrent writes to one field resolve by the document
/// store's last-write-wins and the losing upload becomes an orphan.
pub struct MediaCoordinator<D: MediaDocument> {
    uploader: Arc<ChunkedUploader>,
    documents: Arc<dyn DocumentStore<D>>,
    keys: Arc<dyn KeyStrategy>,
    cleanup: CleanupPolicy,
    ledger: Arc<dyn OrphanLedger>,
    config: MediaConfig,
}

impl<D: MediaDocument> MediaCoordinator<D> {
    pub fn new(
        uploader: Arc<ChunkedUploader>,
        documents: Arc<dyn DocumentStore<D>>,
        config: MediaConfig,
    ) -> Self {
        Self {
            uploader,
            documents,
            keys: Arc::new(NamespacedKeys::new().with_timestamp(config.timestamp_keys)),
            cleanup: config.cleanup_policy(),
            ledger: Arc::new(MemoryOrphanLedger::new()),
            config,
        }
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn KeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_cleanup_policy(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Share one ledger between coordinators and the sweeper
    pub fn with_ledger(mut self, ledger: Arc<dyn OrphanLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn OrphanLedger> {
        &self.ledger
    }

    pub fn uploader(&self) -> &Arc<ChunkedUploader> {
        &self.uploader
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Upload media into an empty field and persist the reference.
    ///
    /// Fails with `InvalidInput` if the field already holds media.
    #[instrument(skip_all, fields(kind = D::KIND, document = %id, field = %field))]
    pub async fn attach(
        &self,
        id: &DocumentId,
        field: MediaField,
        input: UploadInput,
    ) -> MediaResult<ObjectReference> {
        transition(OperationState::Start);
        finish(self.attach_inner(id, field, input).await)
    }

    /// Upload new media, persist it, then delete the object it supersedes.
    ///
    /// If the upload fails the field and the old object are untouched. If the
    /// document write fails the new object is recorded as an orphan and the
    /// old reference stays valid.
    #[instrument(skip_all, fields(kind = D::KIND, document = %id, field = %field))]
    pub async fn replace(
        &self,
        id: &DocumentId,
        field: MediaField,
        input: UploadInput,
    ) -> MediaResult<ObjectReference> {
        transition(OperationState::Start);
        finish(self.replace_inner(id, field, input).await)
    }

    /// Remove the record that owns `field` along with its media.
    ///
    /// For a sub-record (a lecture) only that record and its object go. For a
    /// field owned by the document itself the whole document is removed and
    /// every object it references is deleted.
    #[instrument(skip_all, fields(kind = D::KIND, document = %id, field = %field))]
    pub async fn release(&self, id: &DocumentId, field: MediaField) -> MediaResult<ReleaseOutcome> {
        transition(OperationState::Start);
        finish(self.release_inner(id, field).await)
    }

    async fn attach_inner(
        &self,
        id: &DocumentId,
        field: MediaField,
        input: UploadInput,
    ) -> MediaResult<ObjectReference> {
        input.validate()?;
        let mut document = self.load(id).await?;
        let current = current_slot(&document, &field)?;
        if !current.is_empty() {
            return Err(MediaError::invalid(format!(
                "{} already holds {}; use replace",
                field, current.key
            )));
        }

        let key = self.object_key(&field, &input, "").await?;
        let pending = self.pending(&key, "");
        let (reference, pending) = self.upload(&key, &input, pending).await?;
        self.persist_reference(&mut document, &field, &reference, pending)
            .await?;

        info!("Attached {} to {} {}", reference.key, D::KIND, id);
        Ok(reference)
    }

    async fn replace_inner(
        &self,
        id: &DocumentId,
        field: MediaField,
        input: UploadInput,
    ) -> MediaResult<ObjectReference> {
        input.validate()?;
        let mut document = self.load(id).await?;
        let old = current_slot(&document, &field)?.clone();
        if old.is_empty() {
            return Err(MediaError::invalid(format!("{} holds no media; use attach", field)));
        }

        let key = self.object_key(&field, &input, &old.key).await?;
        let pending = self.pending(&key, &old.key);
        let (reference, pending) = self.upload(&key, &input, pending).await?;
        self.persist_reference(&mut document, &field, &reference, pending)
            .await?;

        if reference.key == old.key {
            // Same key: the upload overwrote the old object in place
            debug!("Replaced {} in place", old.key);
        } else {
            transition(OperationState::StorageCleanup);
            self.delete_or_orphan(&old.key).await;
        }

        info!("Replaced {} with {} on {} {}", old.key, reference.key, D::KIND, id);
        Ok(reference)
    }

    async fn release_inner(&self, id: &DocumentId, field: MediaField) -> MediaResult<ReleaseOutcome> {
        let mut document = self.load(id).await?;
        let target = current_slot(&document, &field)?.clone();

        transition(OperationState::StorageOp);
        let released = if field.is_sub_record() {
            vec![target]
        } else {
            document.references()
        };

        let mut outcome = ReleaseOutcome::default();
        for reference in released.iter().filter(|r| !r.is_empty()) {
            if self.delete_or_orphan(&reference.key).await {
                outcome.deleted.push(reference.key.clone());
            } else {
                outcome.orphaned.push(reference.key.clone());
            }
        }

        transition(OperationState::DocumentPersist);
        if field.is_sub_record() {
            document.remove_record(&field);
            self.documents
                .save(&document)
                .await
                .map_err(MediaError::persist)?;
            info!("Released {} from {} {}", field, D::KIND, id);
        } else {
            self.documents
                .remove_by_id(id)
                .await
                .map_err(MediaError::persist)?;
            info!("Released {} {} and {} objects", D::KIND, id, released.len());
        }

        Ok(outcome)
    }

    async fn load(&self, id: &DocumentId) -> MediaResult<D> {
        self.documents
            .find_by_id(id)
            .await
            .map_err(MediaError::persist)?
            .ok_or_else(|| MediaError::not_found(format!("{} {}", D::KIND, id)))
    }

    /// Key for a new upload into `field`.
    ///
    /// When the key strategy can hand out a key twice, a key that already
    /// names an object is refused unless it is `current`, the key the field
    /// itself holds.
    async fn object_key(
        &self,
        field: &MediaField,
        input: &UploadInput,
        current: &str,
    ) -> MediaResult<String> {
        let namespace = match field {
            MediaField::Avatar => &self.config.avatar_namespace,
            _ => &self.config.namespace,
        };
        let key = self.keys.object_key(namespace, &input.original_name);

        if !self.keys.unique_per_upload()
            && key != current
            && self.uploader.store().exists(&key).await?
        {
            return Err(MediaError::invalid(format!("object key {} is already in use", key)));
        }
        Ok(key)
    }

    /// Guard for an object written under `key`. An in-place overwrite of
    /// `current` stays referenced either way, so its guard is inert.
    fn pending(&self, key: &str, current: &str) -> PendingOrphan {
        let key = if key == current { "" } else { key };
        PendingOrphan::new(&self.ledger, self.cleanup.record_orphans, key)
    }

    /// Upload `input` under `key`. `pending` is armed before the first byte is
    /// sent, so dropping this future mid-upload leaves a ledger entry for
    /// whatever the backend may have kept. A returned error means nothing was
    /// stored and the guard is settled.
    async fn upload(
        &self,
        key: &str,
        input: &UploadInput,
        pending: PendingOrphan,
    ) -> MediaResult<(ObjectReference, PendingOrphan)> {
        transition(OperationState::StorageOp);
        let uploaded = self
            .uploader
            .upload(
                &input.source,
                key,
                input.declared_size,
                input.content_type.as_deref(),
            )
            .await;

        match uploaded {
            Ok(reference) => Ok((reference, pending)),
            Err(e) => {
                pending.settle();
                Err(e.into())
            }
        }
    }

    /// Write `reference` into `field` with a single document write. Until the
    /// write lands the new object is owned by nothing; if the write fails or
    /// this future is dropped first, `pending` records it in the orphan ledger.
    async fn persist_reference(
        &self,
        document: &mut D,
        field: &MediaField,
        reference: &ObjectReference,
        pending: PendingOrphan,
    ) -> MediaResult<()> {
        transition(OperationState::DocumentPersist);

        match self.write_field(document, field, reference).await {
            Ok(()) => {
                pending.settle();
                Ok(())
            }
            Err(e) => {
                pending.fail(OrphanReason::PersistFailed);
                Err(e)
            }
        }
    }

    async fn write_field(
        &self,
        document: &mut D,
        field: &MediaField,
        reference: &ObjectReference,
    ) -> MediaResult<()> {
        let id = document.id().clone();
        let slot = document
            .slot_mut(field)
            .ok_or_else(|| MediaError::not_found(format!("{} on {} {}", field, D::KIND, id)))?;
        *slot = reference.clone();

        let written = match document.field_patch(field) {
            Some(patch) => self.documents.update_one(document.id(), patch).await,
            None => self.documents.save(document).await,
        };
        written.map_err(MediaError::persist)
    }

    /// Delete `key` under the cleanup retry policy. A delete that still fails
    /// is logged and recorded; it never fails the operation.
    async fn delete_or_orphan(&self, key: &str) -> bool {
        let uploader = &self.uploader;
        match self
            .cleanup
            .delete_retry
            .retry(|_| uploader.delete(key))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to delete {}: {}", key, e);
                if self.cleanup.record_orphans {
                    self.ledger
                        .record(OrphanRecord::new(key, OrphanReason::DeleteFailed));
                }
                false
            }
        }
    }
}

impl MediaCoordinator<Course> {
    /// Add a lecture to a course, uploading its video first when one is given.
    #[instrument(skip_all, fields(kind = "Course", document = %course_id))]
    pub async fn add_lecture(
        &self,
        course_id: &DocumentId,
        draft: LectureDraft,
        input: Option<UploadInput>,
    ) -> MediaResult<Lecture> {
        transition(OperationState::Start);
        finish(self.add_lecture_inner(course_id, draft, input).await)
    }

    async fn add_lecture_inner(
        &self,
        course_id: &DocumentId,
        draft: LectureDraft,
        input: Option<UploadInput>,
    ) -> MediaResult<Lecture> {
        if draft.title.trim().is_empty() || draft.description.trim().is_empty() {
            return Err(MediaError::invalid("lecture title and description are required"));
        }
        if let Some(input) = &input {
            input.validate()?;
        }
        let mut course = self.load(course_id).await?;

        let lecture_id = LectureId::new();
        let (reference, pending) = match &input {
            Some(input) => {
                let key = self.object_key(&MediaField::Lecture(lecture_id), input, "").await?;
                let pending = self.pending(&key, "");
                self.upload(&key, input, pending).await?
            }
            None => (ObjectReference::empty(), self.pending("", "")),
        };
        let lecture = Lecture {
            id: lecture_id,
            title: draft.title,
            description: draft.description,
            lecture: reference,
        };

        transition(OperationState::DocumentPersist);
        course.push_lecture(lecture.clone());
        if let Err(e) = self.documents.save(&course).await {
            pending.fail(OrphanReason::PersistFailed);
            return Err(MediaError::persist(e));
        }
        pending.settle();

        info!("Added lecture {} to Course {}", lecture.id, course_id);
        Ok(lecture)
    }
}

fn current_slot<'a, D: MediaDocument>(
    document: &'a D,
    field: &MediaField,
) -> MediaResult<&'a ObjectReference> {
    document.slot(field).ok_or_else(|| match field {
        MediaField::Lecture(lecture) => MediaError::not_found(format!(
            "Lecture {} in {} {}",
            lecture,
            D::KIND,
            document.id()
        )),
        other => MediaError::invalid(format!("{} has no {} field", D::KIND, other)),
    })
}

fn transition(state: OperationState) {
    debug!(state = %state, "media operation");
}

fn finish<T>(result: MediaResult<T>) -> MediaResult<T> {
    match &result {
        Ok(_) => transition(OperationState::Done),
        Err(e) => warn!(state = %OperationState::Failed, "Media operation failed: {}", e),
    }
    result
}

/// An object being uploaded, or uploaded and not yet referenced by any document.
///
/// Settled once the document write lands, or when the upload fails without
/// storing anything. Failing it, or dropping it
/// unsettled, records the key in the orphan ledger.
struct PendingOrphan {
    ledger: Option<Arc<dyn OrphanLedger>>,
    record: bool,
    key: String,
}

impl PendingOrphan {
    fn new(ledger: &Arc<dyn OrphanLedger>, record: bool, key: &str) -> Self {
        Self {
            ledger: (!key.is_empty()).then(|| ledger.clone()),
            record,
            key: key.to_string(),
        }
    }

    fn settle(mut self) {
        self.ledger = None;
    }

    fn fail(mut self, reason: OrphanReason) {
        self.flag(reason);
    }

    fn flag(&mut self, reason: OrphanReason) {
        let Some(ledger) = self.ledger.take() else {
            return;
        };
        warn!("Object {} is not referenced by any document ({})", self.key, reason);
        if self.record {
            ledger.record(OrphanRecord::new(self.key.clone(), reason));
        }
    }
}

impl Drop for PendingOrphan {
    fn drop(&mut self) {
        self.flag(OrphanReason::Cancelled);
    }
}
