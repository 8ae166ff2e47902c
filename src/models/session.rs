//! Represents an upload session, a token-identified staging area.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

/// Per-session rules applied to every incoming file.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Allowed extensions, normalized to lower case with a leading dot.
    /// Empty means unrestricted.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    /// Raw file-type descriptions accepted when MIME sniffing disagrees with the
    /// extension.
    #[serde(default)]
    pub allowed_file_types: Vec<String>,

    /// Expand `.zip` uploads into one upload per entry.
    #[serde(default)]
    pub expand_archives: bool,
}

impl ValidationPolicy {
    /// Build a policy from the whitespace separated extension list and newline
    /// separated file-type list used by the configuration surface.
    pub fn from_lists(extensions: &str, file_types: &str, expand_archives: bool) -> Self {
        Self {
            allowed_extensions: extensions
                .split_whitespace()
                .filter_map(normalize_extension)
                .collect(),
            allowed_file_types: file_types
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            expand_archives,
        }
    }

    /// Copy of this policy with any provided list or flag replacing its counterpart.
    pub fn with_overrides(
        &self,
        extensions: Option<&str>,
        file_types: Option<&str>,
        expand_archives: Option<bool>,
    ) -> Self {
        let parsed = Self::from_lists(extensions.unwrap_or(""), file_types.unwrap_or(""), false);
        Self {
            allowed_extensions: match extensions {
                Some(_) => parsed.allowed_extensions,
                None => self.allowed_extensions.clone(),
            },
            allowed_file_types: match file_types {
                Some(_) => parsed.allowed_file_types,
                None => self.allowed_file_types.clone(),
            },
            expand_archives: expand_archives.unwrap_or(self.expand_archives),
        }
    }
}

/// Lower-case an extension and make sure it starts with a dot.
pub fn normalize_extension(ext: &str) -> Option<String> {
    let trimmed = ext.trim();
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if lower.starts_with('.') {
        Some(lower)
    } else {
        Some(format!(".{}", lower))
    }
}

/// A staging area for uploads awaiting commit.
///
/// Created on first access when the caller presents no token, mutated by uploads
/// and metadata merges, deleted by a successful attach or by abandonment.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Session {
    /// Opaque 32-character hex token handed to the client.
    pub id: String,

    /// Acting user at creation time, if any.
    pub owner: Option<String>,

    /// Kind of object these uploads will attach to. Selects property definitions.
    pub target_kind: Option<String>,

    /// Free-form grouping so one owner can run several sessions side by side.
    pub scope: String,

    pub created_at: DateTime<Utc>,

    pub policy: Json<ValidationPolicy>,

    /// Accumulated custom field values.
    pub metadata: Json<Metadata>,
}

impl Session {
    /// Name of the hidden form field carrying this session's token.
    pub fn field_name(&self) -> String {
        context_key(&self.scope)
    }
}

/// Hidden field name for a scope: `attachments` or `attachments-<scope>`.
pub fn context_key(scope: &str) -> String {
    if scope.is_empty() {
        "attachments".to_string()
    } else {
        format!("attachments-{}", scope)
    }
}
