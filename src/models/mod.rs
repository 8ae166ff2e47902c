//! Core data models for the attachment staging service.
//!
//! Sessions and their uploads are the temporary staging area; attachments are the
//! permanent records owned by arbitrary host objects. Every entity maps to a SQLite
//! table via `sqlx::FromRow` and serializes as JSON via `serde`.

use std::collections::BTreeMap;

pub mod attachment;
pub mod property;
pub mod session;
pub mod upload;

/// Custom field values keyed by field name. Every key carries a list because form
/// fields may repeat.
pub type Metadata = BTreeMap<String, Vec<String>>;
