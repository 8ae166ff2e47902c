//! HTTP handlers. Each one extracts its inputs, calls the [`SessionEngine`] and
//! renders the `{ok, ...}` envelope.
//!
//! [`SessionEngine`]: crate::services::session_engine::SessionEngine

pub mod attachment_handlers;
pub mod health_handlers;
pub mod session_handlers;
pub mod upload_handlers;

use crate::models::Metadata;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Header carrying the acting user's id, set by the fronting application.
pub const USER_HEADER: &str = "x-user-id";

/// Acting user from [`USER_HEADER`], if present and non-blank.
pub fn actor(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A submitted form value: a single string or a repeated field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    One(String),
    Many(Vec<String>),
}

/// JSON rendition of a form post, e.g. `{"upload-3-title": "Q3", "upload-3-tags": ["a", "b"]}`.
pub type FormValues = BTreeMap<String, FieldValue>;

pub fn into_metadata(values: FormValues) -> Metadata {
    values
        .into_iter()
        .map(|(key, value)| {
            let list = match value {
                FieldValue::One(v) => vec![v],
                FieldValue::Many(vs) => vs,
            };
            (key, list)
        })
        .collect()
}
