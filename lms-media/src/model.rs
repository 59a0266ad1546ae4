//! Documents that own media, and how the coordinator addresses their fields.

use std::fmt;

use lms_blob::ObjectReference;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Document identifier as issued by the document store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a lecture within its course. Assigned once and never reused,
/// so removing one lecture leaves the others addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LectureId(pub Uuid);

impl LectureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LectureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LectureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which reference inside a document an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaField {
    Thumbnail,
    Avatar,
    Lecture(LectureId),
}

impl MediaField {
    /// Whether the field lives in a sub-record that can be removed on its own
    pub fn is_sub_record(&self) -> bool {
        matches!(self, MediaField::Lecture(_))
    }
}

impl fmt::Display for MediaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaField::Thumbnail => write!(f, "thumbnail"),
            MediaField::Avatar => write!(f, "avatar"),
            MediaField::Lecture(id) => write!(f, "lecture:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lecture {
    pub id: LectureId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub lecture: ObjectReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub created_by: String,
    #[serde(default)]
    pub thumbnail: ObjectReference,
    #[serde(default)]
    pub lectures: Vec<Lecture>,
    #[serde(default)]
    pub number_of_lectures: usize,
}

impl Course {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: DocumentId::new(),
            title: title.into(),
            description: description.into(),
            category: category.into(),
            created_by: created_by.into(),
            thumbnail: ObjectReference::empty(),
            lectures: Vec::new(),
            number_of_lectures: 0,
        }
    }

    pub fn lecture(&self, id: &LectureId) -> Option<&Lecture> {
        self.lectures.iter().find(|lecture| lecture.id == *id)
    }

    pub fn push_lecture(&mut self, lecture: Lecture) {
        self.lectures.push(lecture);
        self.number_of_lectures = self.lectures.len();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: ObjectReference,
}

impl User {
    pub fn new(full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(),
            full_name: full_name.into(),
            email: email.into(),
            avatar: ObjectReference::empty(),
        }
    }
}

/// A document holding one or more [`ObjectReference`]s.
pub trait MediaDocument: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Collection name used in messages and logs
    const KIND: &'static str;

    fn id(&self) -> &DocumentId;

    /// The reference at `field`, or `None` when the document has no such field
    /// (a lecture that does not exist, or a field this kind never carries)
    fn slot(&self, field: &MediaField) -> Option<&ObjectReference>;

    fn slot_mut(&mut self, field: &MediaField) -> Option<&mut ObjectReference>;

    /// Every non-empty reference the document owns
    fn references(&self) -> Vec<ObjectReference>;

    /// Top-level patch writing `field` as it currently stands, for
    /// `update_one`. Sub-record fields have none; the whole document is saved.
    fn field_patch(&self, field: &MediaField) -> Option<serde_json::Value>;

    /// Remove the sub-record owning `field`. Returns false when the field is
    /// owned by the document itself or the record is already gone.
    fn remove_record(&mut self, field: &MediaField) -> bool;
}

impl MediaDocument for Course {
    const KIND: &'static str = "Course";

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn slot(&self, field: &MediaField) -> Option<&ObjectReference> {
        match field {
            MediaField::Thumbnail => Some(&self.thumbnail),
            MediaField::Lecture(id) => self.lecture(id).map(|lecture| &lecture.lecture),
            MediaField::Avatar => None,
        }
    }

    fn slot_mut(&mut self, field: &MediaField) -> Option<&mut ObjectReference> {
        match field {
            MediaField::Thumbnail => Some(&mut self.thumbnail),
            MediaField::Lecture(id) => self
                .lectures
                .iter_mut()
                .find(|lecture| lecture.id == *id)
                .map(|lecture| &mut lecture.lecture),
            MediaField::Avatar => None,
        }
    }

    fn references(&self) -> Vec<ObjectReference> {
        std::iter::once(&self.thumbnail)
            .chain(self.lectures.iter().map(|lecture| &lecture.lecture))
            .filter(|reference| !reference.is_empty())
            .cloned()
            .collect()
    }

    fn field_patch(&self, field: &MediaField) -> Option<serde_json::Value> {
        match field {
            MediaField::Thumbnail => Some(json!({ "thumbnail": self.thumbnail })),
            _ => None,
        }
    }

    fn remove_record(&mut self, field: &MediaField) -> bool {
        let MediaField::Lecture(id) = field else {
            return false;
        };
        let Some(index) = self.lectures.iter().position(|lecture| lecture.id == *id) else {
            return false;
        };
        self.lectures.remove(index);
        self.number_of_lectures = self.lectures.len();
        true
    }
}

impl MediaDocument for User {
    const KIND: &'static str = "User";

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn slot(&self, field: &MediaField) -> Option<&ObjectReference> {
        match field {
            MediaField::Avatar => Some(&self.avatar),
            _ => None,
        }
    }

    fn slot_mut(&mut self, field: &MediaField) -> Option<&mut ObjectReference> {
        match field {
            MediaField::Avatar => Some(&mut self.avatar),
            _ => None,
        }
    }

    fn references(&self) -> Vec<ObjectReference> {
        if self.avatar.is_empty() {
            Vec::new()
        } else {
            vec![self.avatar.clone()]
        }
    }

    fn field_patch(&self, field: &MediaField) -> Option<serde_json::Value> {
        match field {
            MediaField::Avatar => Some(json!({ "avatar": self.avatar })),
            _ => None,
        }
    }

    fn remove_record(&mut self, _field: &MediaField) -> bool {
        false
    }
}
