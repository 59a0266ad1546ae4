use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lms_blob::{
    BlobConfig, ChunkedUploader, Fault, MemoryBlobStore, ObjectReference, StoreOp, UploadInput,
    UploadRules,
};
use lms_media::{
    CleanupPolicy, Course, DocOp, DocumentId, LectureDraft, MediaConfig, MediaCoordinator,
    MediaError, MediaField, MemoryDocumentStore, MemoryOrphanLedger, OrphanReason, OrphanSweeper,
    RetryPolicy, User,
};

struct Harness<D: lms_media::MediaDocument> {
    blobs: MemoryBlobStore,
    documents: MemoryDocumentStore<D>,
    ledger: MemoryOrphanLedger,
    coordinator: Arc<MediaCoordinator<D>>,
}

/// Bare file names as keys so tests can name objects directly
fn harness<D: lms_media::MediaDocument>(blob_config: BlobConfig) -> Harness<D> {
    let config = MediaConfig::new()
        .with_namespace("")
        .with_avatar_namespace("avatars")
        .with_timestamp_keys(false);
    harness_with(blob_config, config)
}

fn harness_with<D: lms_media::MediaDocument>(
    blob_config: BlobConfig,
    config: MediaConfig,
) -> Harness<D> {
    let blobs = MemoryBlobStore::new();
    let documents = MemoryDocumentStore::<D>::new();
    let ledger = MemoryOrphanLedger::new();

    let uploader = Arc::new(ChunkedUploader::new(blobs.clone(), blob_config));
    let coordinator = MediaCoordinator::<D>::new(uploader, Arc::new(documents.clone()), config)
        .with_cleanup_policy(CleanupPolicy {
            delete_retry: RetryPolicy::default()
                .with_max_attempts(2)
                .with_backoff(Duration::ZERO, Duration::ZERO),
            record_orphans: true,
        })
        .with_ledger(Arc::new(ledger.clone()));

    Harness {
        blobs,
        documents,
        ledger,
        coordinator: Arc::new(coordinator),
    }
}

/// Four-byte parts, so a 20-byte video is a five-part multipart upload
fn small_parts() -> BlobConfig {
    BlobConfig::new()
        .with_multipart_threshold(8)
        .with_upload_rules(UploadRules::new().with_part_size(4))
}

fn course_with_thumbnail(h: &Harness<Course>, key: &str) -> Course {
    let mut course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.blobs.insert(key, vec![1u8; 16]);
    course.thumbnail = ObjectReference::new(key, format!("memory://media/{}", key));
    h.documents.insert(&course).unwrap();
    course
}

fn file(name: &str, len: usize) -> UploadInput {
    UploadInput::from_bytes(name, vec![7u8; len])
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn replace_thumbnail_swaps_the_stored_object() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");

    let reference = h
        .coordinator
        .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 1024))
        .await
        .unwrap();

    assert_eq!(reference, ObjectReference::new("new.jpg", "memory://media/new.jpg"));
    let stored = h.documents.get(&course.id).unwrap();
    assert_eq!(stored.thumbnail, reference);
    assert!(!h.blobs.contains("old.jpg"));
    assert!(h.blobs.contains("new.jpg"));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn attach_fills_an_empty_field() {
    let h = harness::<Course>(BlobConfig::default());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();

    let reference = h
        .coordinator
        .attach(&course.id, MediaField::Thumbnail, file("cover.jpg", 64))
        .await
        .unwrap();

    assert_eq!(reference.key, "cover.jpg");
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail, reference);
    assert_eq!(h.documents.calls(DocOp::Update), 1);
}

#[tokio::test]
async fn attach_refuses_a_field_that_holds_media() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");

    let err = h
        .coordinator
        .attach(&course.id, MediaField::Thumbnail, file("new.jpg", 64))
        .await
        .unwrap_err();

    assert!(matches!(err, MediaError::InvalidInput { .. }));
    assert_eq!(err.code(), 400);
    assert_eq!(h.blobs.calls(StoreOp::Put), 0);
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "old.jpg");
}

#[tokio::test]
async fn old_object_outlives_the_document_update() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.blobs
        .inject(StoreOp::Delete, None, Fault::Delay(Duration::from_millis(150)));

    let task = {
        let coordinator = h.coordinator.clone();
        let id = course.id.clone();
        tokio::spawn(async move {
            coordinator
                .replace(&id, MediaField::Thumbnail, file("new.jpg", 1024))
                .await
        })
    };

    let documents = h.documents.clone();
    let id = course.id.clone();
    wait_until(|| documents.get(&id).map_or(false, |c| c.thumbnail.key == "new.jpg")).await;
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "new.jpg");
    assert!(h.blobs.contains("old.jpg"), "old object must still exist mid-replace");
    assert!(h.blobs.contains("new.jpg"));

    task.await.unwrap().unwrap();
    assert!(!h.blobs.contains("old.jpg"));
}

#[tokio::test]
async fn failed_upload_leaves_field_and_old_object_intact() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.blobs.inject(StoreOp::Put, None, Fault::Fail);

    let err = h
        .coordinator
        .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 1024))
        .await
        .unwrap_err();

    assert!(matches!(err, MediaError::StorageFailure { .. }));
    assert_eq!(err.code(), 500);
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "old.jpg");
    assert!(h.blobs.contains("old.jpg"));
    assert_eq!(h.documents.calls(DocOp::Update), 0);
    assert_eq!(h.blobs.calls(StoreOp::Delete), 0);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn failed_multipart_replace_aborts_and_keeps_old_video() {
    let h = harness::<Course>(small_parts());
    let mut course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();
    let lecture = h
        .coordinator
        .add_lecture(&course.id, LectureDraft::new("Intro", "Welcome"), Some(file("v1.mp4", 20)))
        .await
        .unwrap();
    h.blobs.inject(StoreOp::UploadPart, Some(8), Fault::Fail);

    let err = h
        .coordinator
        .replace(&course.id, MediaField::Lecture(lecture.id), file("v2.mp4", 20))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 500);
    assert_eq!(h.blobs.calls(StoreOp::AbortMultipart), 1);
    assert_eq!(h.blobs.pending_uploads(), 0);
    course = h.documents.get(&course.id).unwrap();
    assert_eq!(course.lectures[0].lecture.key, "v1.mp4");
    assert!(h.blobs.contains("v1.mp4"));
    assert!(!h.blobs.contains("v2.mp4"));
}

#[tokio::test]
async fn persist_failure_orphans_the_new_object() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.documents.inject(DocOp::Update, Fault::Fail);

    let err = h
        .coordinator
        .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 1024))
        .await
        .unwrap_err();

    assert!(matches!(err, MediaError::PersistFailure { .. }));
    assert_eq!(err.code(), 500);
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "old.jpg");
    assert!(h.blobs.contains("old.jpg"));
    assert!(h.blobs.contains("new.jpg"), "new object is kept, not deleted");
    assert_eq!(
        h.ledger.get("new.jpg").map(|r| r.reason),
        Some(OrphanReason::PersistFailed)
    );
}

#[tokio::test]
async fn failed_cleanup_delete_does_not_fail_replace() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.blobs.inject(StoreOp::Delete, None, Fault::Fail);

    let reference = h
        .coordinator
        .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 1024))
        .await
        .unwrap();

    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail, reference);
    assert_eq!(h.blobs.calls(StoreOp::Delete), 2);
    assert!(h.blobs.contains("old.jpg"));
    assert_eq!(
        h.ledger.get("old.jpg").map(|r| r.reason),
        Some(OrphanReason::DeleteFailed)
    );
}

#[tokio::test]
async fn replace_onto_the_same_key_keeps_the_object() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "cover.jpg");

    h.coordinator
        .replace(&course.id, MediaField::Thumbnail, file("cover.jpg", 32))
        .await
        .unwrap();

    assert_eq!(h.blobs.calls(StoreOp::Delete), 0);
    assert_eq!(h.blobs.object("cover.jpg").unwrap().len(), 32);
}

#[tokio::test]
async fn add_lecture_uploads_video_in_parts() {
    let h = harness::<Course>(small_parts());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();

    let lecture = h
        .coordinator
        .add_lecture(
            &course.id,
            LectureDraft::new("Ownership", "Moves and borrows"),
            Some(file("ownership.mp4", 20)),
        )
        .await
        .unwrap();

    assert_eq!(lecture.lecture.key, "ownership.mp4");
    assert_eq!(h.blobs.part_sizes("ownership.mp4").unwrap(), vec![4; 5]);

    let stored = h.documents.get(&course.id).unwrap();
    assert_eq!(stored.lectures, vec![lecture]);
    assert_eq!(stored.number_of_lectures, 1);
}

#[tokio::test]
async fn add_lecture_requires_title_and_description() {
    let h = harness::<Course>(BlobConfig::default());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();

    let err = h
        .coordinator
        .add_lecture(&course.id, LectureDraft::new("  ", "Welcome"), Some(file("a.mp4", 8)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 400);
    assert_eq!(h.blobs.calls(StoreOp::Put), 0);
    assert_eq!(h.documents.calls(DocOp::Find), 0);
}

#[tokio::test]
async fn release_lecture_keeps_its_siblings() {
    let h = harness::<Course>(BlobConfig::default());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();

    let mut lectures = Vec::new();
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        let lecture = h
            .coordinator
            .add_lecture(&course.id, LectureDraft::new(name, "lecture"), Some(file(name, 16)))
            .await
            .unwrap();
        lectures.push(lecture);
    }

    let outcome = h
        .coordinator
        .release(&course.id, MediaField::Lecture(lectures[1].id))
        .await
        .unwrap();

    assert_eq!(outcome.deleted, vec!["b.mp4".to_string()]);
    let stored = h.documents.get(&course.id).unwrap();
    assert_eq!(stored.lectures, vec![lectures[0].clone(), lectures[2].clone()]);
    assert_eq!(stored.number_of_lectures, 2);
    assert!(!h.blobs.contains("b.mp4"));
    assert!(h.blobs.contains("a.mp4"));
    assert!(h.blobs.contains("c.mp4"));

    // Remaining lectures are still addressable by their original identity
    h.coordinator
        .release(&course.id, MediaField::Lecture(lectures[2].id))
        .await
        .unwrap();
    assert_eq!(h.documents.get(&course.id).unwrap().lectures, vec![lectures[0].clone()]);
}

#[tokio::test]
async fn release_course_deletes_every_object_it_owns() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "thumb.jpg");
    for name in ["a.mp4", "b.mp4"] {
        h.coordinator
            .add_lecture(&course.id, LectureDraft::new(name, "lecture"), Some(file(name, 16)))
            .await
            .unwrap();
    }

    let mut outcome = h
        .coordinator
        .release(&course.id, MediaField::Thumbnail)
        .await
        .unwrap();
    outcome.deleted.sort();

    assert_eq!(outcome.deleted, vec!["a.mp4", "b.mp4", "thumb.jpg"]);
    assert!(outcome.orphaned.is_empty());
    assert!(h.documents.get(&course.id).is_none());
    assert!(h.blobs.keys().is_empty());
}

#[tokio::test]
async fn release_with_failed_delete_still_removes_the_record() {
    let h = harness::<Course>(BlobConfig::default());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();
    let lecture = h
        .coordinator
        .add_lecture(&course.id, LectureDraft::new("Intro", "Welcome"), Some(file("a.mp4", 16)))
        .await
        .unwrap();
    h.blobs.inject(StoreOp::Delete, None, Fault::Fail);

    let outcome = h
        .coordinator
        .release(&course.id, MediaField::Lecture(lecture.id))
        .await
        .unwrap();

    assert_eq!(outcome.orphaned, vec!["a.mp4".to_string()]);
    assert!(h.documents.get(&course.id).unwrap().lectures.is_empty());
    assert_eq!(
        h.ledger.get("a.mp4").map(|r| r.reason),
        Some(OrphanReason::DeleteFailed)
    );
}

#[tokio::test]
async fn avatar_lifecycle_for_users() {
    let h = harness::<User>(BlobConfig::default());
    let user = User::new("Ada Lovelace", "ada@example.com");
    h.documents.insert(&user).unwrap();

    let first = h
        .coordinator
        .attach(&user.id, MediaField::Avatar, file("me.png", 128))
        .await
        .unwrap();
    assert_eq!(first.key, "avatars/me.png");

    let second = h
        .coordinator
        .replace(&user.id, MediaField::Avatar, file("me-2024.png", 128))
        .await
        .unwrap();
    assert_eq!(h.documents.get(&user.id).unwrap().avatar, second);
    assert!(!h.blobs.contains("avatars/me.png"));

    h.coordinator
        .release(&user.id, MediaField::Avatar)
        .await
        .unwrap();
    assert!(h.documents.is_empty());
    assert!(h.blobs.keys().is_empty());
}

#[tokio::test]
async fn missing_documents_and_lectures_are_not_found() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "thumb.jpg");

    let err = h
        .coordinator
        .replace(&DocumentId::from("missing"), MediaField::Thumbnail, file("x.jpg", 8))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::NotFound { .. }));
    assert_eq!(err.to_json()["code"], 404);

    let err = h
        .coordinator
        .release(&course.id, MediaField::Lecture(lms_media::LectureId::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    assert_eq!(h.blobs.calls(StoreOp::Put), 0);
    assert_eq!(h.blobs.calls(StoreOp::Delete), 0);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_side_effect() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "thumb.jpg");

    let err = h
        .coordinator
        .replace(&course.id, MediaField::Thumbnail, file("empty.jpg", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);
    assert_eq!(h.documents.calls(DocOp::Find), 0);

    let err = h
        .coordinator
        .attach(&course.id, MediaField::Avatar, file("me.png", 8))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);

    let err = h
        .coordinator
        .replace(
            &course.id,
            MediaField::Thumbnail,
            UploadInput::new(lms_blob::ByteSource::file("/nonexistent/cover.jpg"), 8, "cover.jpg"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);

    assert_eq!(h.blobs.calls(StoreOp::Put), 0);
    assert_eq!(h.blobs.calls(StoreOp::InitMultipart), 0);
}

#[tokio::test]
async fn cancelled_upload_is_aborted_and_document_untouched() {
    let h = harness::<Course>(small_parts());
    let course = Course::new("Rust", "Systems programming", "Programming", "admin");
    h.documents.insert(&course).unwrap();
    let lecture = h
        .coordinator
        .add_lecture(&course.id, LectureDraft::new("Intro", "Welcome"), None)
        .await
        .unwrap();
    h.blobs.inject(StoreOp::UploadPart, Some(2), Fault::Stall);

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        h.coordinator
            .attach(&course.id, MediaField::Lecture(lecture.id), file("intro.mp4", 20)),
    )
    .await;
    assert!(attempt.is_err());

    let blobs = h.blobs.clone();
    wait_until(|| blobs.calls(StoreOp::AbortMultipart) == 1).await;
    assert_eq!(h.blobs.calls(StoreOp::AbortMultipart), 1);
    assert_eq!(h.blobs.pending_uploads(), 0);
    assert!(!h.blobs.contains("intro.mp4"));
    assert!(h.documents.get(&course.id).unwrap().lectures[0].lecture.is_empty());
    assert_eq!(
        h.ledger.get("intro.mp4").map(|r| r.reason),
        Some(OrphanReason::Cancelled)
    );
}

#[tokio::test]
async fn cancelled_single_put_is_recorded_and_reconciled() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.blobs
        .inject(StoreOp::Put, None, Fault::Delay(Duration::from_millis(200)));

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        h.coordinator
            .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 64)),
    )
    .await;
    assert!(attempt.is_err());

    assert_eq!(
        h.ledger.get("new.jpg").map(|r| r.reason),
        Some(OrphanReason::Cancelled)
    );
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "old.jpg");

    let referenced: HashSet<String> = ["old.jpg".to_string()].into_iter().collect();
    let report = OrphanSweeper::new(Arc::new(h.blobs.clone()), Arc::new(h.ledger.clone()))
        .reconcile(&referenced)
        .await;
    assert_eq!(report.deleted, vec!["new.jpg".to_string()]);
    assert!(h.ledger.is_empty());
    assert!(!h.blobs.contains("new.jpg"));
    assert!(h.blobs.contains("old.jpg"));
}

#[tokio::test]
async fn concurrent_same_name_attaches_get_distinct_keys() {
    let h = harness_with::<Course>(BlobConfig::default(), MediaConfig::new().with_namespace("lms"));
    let first = Course::new("Rust", "Systems programming", "Programming", "admin");
    let second = Course::new("Go", "Services", "Programming", "admin");
    h.documents.insert(&first).unwrap();
    h.documents.insert(&second).unwrap();

    let (a, b) = tokio::join!(
        h.coordinator
            .attach(&first.id, MediaField::Thumbnail, file("intro.jpg", 64)),
        h.coordinator
            .attach(&second.id, MediaField::Thumbnail, file("intro.jpg", 64)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.key, b.key);
    assert!(a.key.starts_with("lms/") && a.key.ends_with("-intro.jpg"));
    assert!(h.blobs.contains(&a.key));
    assert!(h.blobs.contains(&b.key));

    h.coordinator
        .replace(&first.id, MediaField::Thumbnail, file("intro.jpg", 32))
        .await
        .unwrap();
    assert!(!h.blobs.contains(&a.key));
    assert!(h.blobs.contains(&b.key), "other course keeps its object");
    assert_eq!(h.documents.get(&second.id).unwrap().thumbnail, b);
}

#[tokio::test]
async fn reused_file_name_is_refused_without_unique_keys() {
    let h = harness::<Course>(BlobConfig::default());
    let first = Course::new("Rust", "Systems programming", "Programming", "admin");
    let second = Course::new("Go", "Services", "Programming", "admin");
    h.documents.insert(&first).unwrap();
    h.documents.insert(&second).unwrap();

    h.coordinator
        .attach(&first.id, MediaField::Thumbnail, file("cover.jpg", 64))
        .await
        .unwrap();
    let err = h
        .coordinator
        .attach(&second.id, MediaField::Thumbnail, file("cover.jpg", 16))
        .await
        .unwrap_err();

    assert!(matches!(err, MediaError::InvalidInput { .. }));
    assert_eq!(h.blobs.calls(StoreOp::Put), 1);
    assert_eq!(h.blobs.object("cover.jpg").unwrap().len(), 64);
    assert!(h.documents.get(&second.id).unwrap().thumbnail.is_empty());
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn cancellation_after_upload_records_an_orphan() {
    let h = harness::<Course>(BlobConfig::default());
    let course = course_with_thumbnail(&h, "old.jpg");
    h.documents.inject(DocOp::Update, Fault::Stall);

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        h.coordinator
            .replace(&course.id, MediaField::Thumbnail, file("new.jpg", 64)),
    )
    .await;
    assert!(attempt.is_err());

    assert_eq!(
        h.ledger.get("new.jpg").map(|r| r.reason),
        Some(OrphanReason::Cancelled)
    );
    assert_eq!(h.documents.get(&course.id).unwrap().thumbnail.key, "old.jpg");
    assert!(h.blobs.contains("old.jpg"));
}
