//! Represents one staged file within a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A file that passed validation and sits in temporary storage.
///
/// The row and the staged bytes live and die together: the row is inserted only
/// after the bytes are durable, and deleting it removes the bytes first.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Monotonic row id. Ordering by id is creation order.
    pub id: i64,

    /// Owning session token.
    pub session_id: String,

    /// Absolute path of the staged bytes.
    pub staged_path: String,

    /// Sanitized client filename.
    pub original_filename: String,

    pub size_bytes: i64,

    pub created_at: DateTime<Utc>,
}

impl Upload {
    /// Prefix of the metadata keys that belong to this upload, e.g. `upload-7-`.
    pub fn field_prefix(&self) -> String {
        format!("upload-{}-", self.id)
    }
}
