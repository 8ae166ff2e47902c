//! Route table for the attachment service.
//!
//! ## Structure
//! - **Sessions**
//!   - `POST /sessions`: resolve or mint a session
//!   - `GET  /sessions/{session_id}`: session and its uploads
//!   - `POST /sessions/{session_id}/uploads`: multipart upload (`attachment` field)
//!   - `POST /sessions/{session_id}/uploads/{upload_id}/delete`
//!   - `POST /sessions/{session_id}/metadata`
//!   - `POST /sessions/{session_id}/attach`
//!   - `POST /sessions/{session_id}/delete`
//!
//! - **Attachments**
//!   - `GET  /attachments/{attachment_id}`
//!   - `POST /attachments/{attachment_id}/update`
//!   - `POST /attachments/{attachment_id}/delete`
//!   - `GET  /attachments/{attachment_id}/download[/{filename}]`
//!   - `GET  /owners/{owner_type}/{owner_id}/attachments`

use crate::{
    handlers::{
        attachment_handlers::{
            delete_attachment, download, download_named, get_attachment, list_attachments,
            update_attachment,
        },
        health_handlers::{healthz, readyz},
        session_handlers::{
            abandon_session, attach, create_session, delete_upload, get_session, merge_metadata,
        },
        upload_handlers::upload,
    },
    services::session_engine::SessionEngine,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `upload_limit` caps upload request bodies in bytes.
pub fn routes(upload_limit: usize) -> Router<SessionEngine> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Sessions
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", get(get_session))
        .route(
            "/sessions/{session_id}/uploads",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/sessions/{session_id}/uploads/{upload_id}/delete",
            post(delete_upload),
        )
        .route("/sessions/{session_id}/metadata", post(merge_metadata))
        .route("/sessions/{session_id}/attach", post(attach))
        .route("/sessions/{session_id}/delete", post(abandon_session))
        // Attachments
        .route("/attachments/{attachment_id}", get(get_attachment))
        .route("/attachments/{attachment_id}/update", post(update_attachment))
        .route("/attachments/{attachment_id}/delete", post(delete_attachment))
        .route("/attachments/{attachment_id}/download", get(download))
        .route(
            "/attachments/{attachment_id}/download/{filename}",
            get(download_named),
        )
        .route(
            "/owners/{owner_type}/{owner_id}/attachments",
            get(list_attachments),
        )
}
