//! Session lifecycle endpoints: create/resolve, inspect, metadata, delete upload,
//! attach and abandon.

use super::{FormValues, actor, into_metadata};
use crate::{
    errors::AppError,
    models::attachment::OwnerRef,
    services::session_engine::{SessionEngine, SessionRequest},
};
use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionReq {
    /// Token from the hidden field, if the client already has one.
    pub session_id: Option<String>,
    #[serde(default)]
    pub scope: String,
    pub target_kind: Option<String>,
    pub allowed_extensions: Option<String>,
    pub allowed_file_types: Option<String>,
    pub expand_archives: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AttachReq {
    pub owner_type: String,
    pub owner_id: String,
    /// Form values to merge into the session before validating.
    #[serde(default)]
    pub metadata: FormValues,
}

/// `POST /sessions`: resolve the presented token or mint a new session.
pub async fn create_session(
    State(engine): State<SessionEngine>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionReq>,
) -> Result<impl IntoResponse, AppError> {
    let request = SessionRequest {
        owner: actor(&headers),
        scope: req.scope,
        target_kind: req.target_kind,
        allowed_extensions: req.allowed_extensions,
        allowed_file_types: req.allowed_file_types,
        expand_archives: req.expand_archives,
    };
    let session = engine
        .resolve_session(req.session_id.as_deref(), &request)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "session_id": session.id,
        "field_name": session.field_name(),
    })))
}

/// `GET /sessions/{session_id}`: the session and its uploads in creation order.
pub async fn get_session(
    State(engine): State<SessionEngine>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = engine.get_session(&session_id).await?;
    let uploads = engine.list_uploads(&session.id).await?;
    let uploads: Vec<_> = uploads
        .iter()
        .map(|u| {
            json!({
                "id": u.id,
                "file_name": u.original_filename,
                "file_size": u.size_bytes,
            })
        })
        .collect();
    Ok(Json(json!({
        "ok": true,
        "session_id": session.id,
        "field_name": session.field_name(),
        "scope": session.scope,
        "target_kind": session.target_kind,
        "uploads": uploads,
    })))
}

/// `POST /sessions/{session_id}/metadata`
pub async fn merge_metadata(
    State(engine): State<SessionEngine>,
    Path(session_id): Path<String>,
    Json(values): Json<FormValues>,
) -> Result<impl IntoResponse, AppError> {
    engine
        .merge_metadata(&session_id, &into_metadata(values))
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /sessions/{session_id}/uploads/{upload_id}/delete`
pub async fn delete_upload(
    State(engine): State<SessionEngine>,
    Path((session_id, upload_id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, AppError> {
    engine.get_session(&session_id).await?;
    engine.delete_upload(&session_id, upload_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /sessions/{session_id}/attach`: validate properties, then commit every
/// upload to the owner.
pub async fn attach(
    State(engine): State<SessionEngine>,
    Path(session_id): Path<String>,
    Json(req): Json<AttachReq>,
) -> Result<impl IntoResponse, AppError> {
    if req.owner_type.trim().is_empty() || req.owner_id.trim().is_empty() {
        return Err(AppError::bad_request("owner_type and owner_id are required"));
    }
    if !req.metadata.is_empty() {
        engine
            .merge_metadata(&session_id, &into_metadata(req.metadata))
            .await?;
    }

    let session = engine.get_session(&session_id).await?;
    engine.validate_session(&session).await?;

    let owner = OwnerRef::new(req.owner_type, req.owner_id);
    let attachments = engine.attach(&session.id, &owner).await?;
    Ok(Json(json!({
        "ok": true,
        "attachments": attachments,
    })))
}

/// `POST /sessions/{session_id}/delete`: abandon the session and its uploads.
pub async fn abandon_session(
    State(engine): State<SessionEngine>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    engine.abandon(&session_id).await?;
    Ok(Json(json!({ "ok": true })))
}
