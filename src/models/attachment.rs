//! Represents a permanently stored file owned by a host object.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

/// Weak reference to a host-application object: a type tag plus an id.
///
/// No referential integrity is enforced; the owner's lifecycle is external.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    /// Type tag such as `crm.contact`.
    pub owner_type: String,
    pub owner_id: String,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id: owner_id.into(),
        }
    }
}

/// A file attached to exactly one owner. The owner pair never changes after insert.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Attachment {
    pub id: i64,

    /// Globally unique permanent location inside the blob storage backend.
    pub storage_path: String,

    pub original_filename: String,

    pub size_bytes: i64,

    pub owner_type: String,

    pub owner_id: String,

    /// User that created the originating session, if any.
    pub uploaded_by: Option<String>,

    /// Scope carried over from the originating session.
    pub scope: String,

    pub created_at: DateTime<Utc>,

    pub properties: Json<Metadata>,
}

impl Attachment {
    pub fn owner(&self) -> OwnerRef {
        OwnerRef::new(&self.owner_type, &self.owner_id)
    }

    /// Prefix of the form keys that edit this attachment's properties.
    pub fn field_prefix(&self) -> String {
        format!("attachment-{}-", self.id)
    }
}

/// Fields of an attachment before the store assigns an id and timestamp.
#[derive(Clone, Debug)]
pub struct NewAttachment {
    pub storage_path: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub owner: OwnerRef,
    pub uploaded_by: Option<String>,
    pub scope: String,
    pub properties: Metadata,
}
