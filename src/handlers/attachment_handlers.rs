//! Endpoints for permanent attachments: view, list, property update, delete and
//! streamed download.

use super::{FormValues, actor, into_metadata};
use crate::{
    errors::AppError,
    models::attachment::OwnerRef,
    services::{download::DownloadBody, session_engine::SessionEngine},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio_util::io::ReaderStream;

const X_SENDFILE: HeaderName = HeaderName::from_static("x-sendfile");

/// `GET /attachments/{attachment_id}`
pub async fn get_attachment(
    State(engine): State<SessionEngine>,
    Path(attachment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let attachment = engine
        .accessible_attachment(attachment_id, actor(&headers).as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "attachment": attachment })))
}

/// `GET /owners/{owner_type}/{owner_id}/attachments`: only the attachments the
/// caller may access are listed.
pub async fn list_attachments(
    State(engine): State<SessionEngine>,
    Path((owner_type, owner_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let attachments = engine
        .list_attachments(&OwnerRef::new(owner_type, owner_id), actor(&headers).as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "attachments": attachments })))
}

/// `POST /attachments/{attachment_id}/update`: replace properties from
/// `attachment-<id>-<slug>` form values.
pub async fn update_attachment(
    State(engine): State<SessionEngine>,
    Path(attachment_id): Path<i64>,
    headers: HeaderMap,
    Json(values): Json<FormValues>,
) -> Result<impl IntoResponse, AppError> {
    let attachment = engine
        .update_properties(
            attachment_id,
            actor(&headers).as_deref(),
            &into_metadata(values),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "attachment": attachment })))
}

/// `POST /attachments/{attachment_id}/delete`
pub async fn delete_attachment(
    State(engine): State<SessionEngine>,
    Path(attachment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    engine
        .accessible_attachment(attachment_id, actor(&headers).as_deref())
        .await?;
    engine.delete_attachment(attachment_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /attachments/{attachment_id}/download`
pub async fn download(
    State(engine): State<SessionEngine>,
    Path(attachment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    download_response(&engine, attachment_id, &headers, None).await
}

/// `GET /attachments/{attachment_id}/download/{filename}`
pub async fn download_named(
    State(engine): State<SessionEngine>,
    Path((attachment_id, filename)): Path<(i64, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    download_response(&engine, attachment_id, &headers, Some(&filename)).await
}

async fn download_response(
    engine: &SessionEngine,
    attachment_id: i64,
    headers: &HeaderMap,
    filename: Option<&str>,
) -> Result<Response, AppError> {
    let download = engine
        .open_download(attachment_id, actor(headers).as_deref(), filename)
        .await?;

    let (mut response, content_length) = match download.body {
        DownloadBody::Stream(reader) => (
            Response::new(Body::from_stream(ReaderStream::new(reader))),
            download.content_length,
        ),
        DownloadBody::Sendfile(path) => {
            let mut response = Response::new(Body::empty());
            let value = HeaderValue::from_str(&path.to_string_lossy()).map_err(|e| {
                tracing::error!("unrepresentable sendfile path {}: {}", path.display(), e);
                AppError::internal()
            })?;
            response.headers_mut().insert(X_SENDFILE, value);
            (response, None)
        }
    };

    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(download.content_type),
    );
    if let Some(len) = content_length {
        resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(disposition) = download.disposition.as_deref() {
        // Filenames are percent-encoded, so this only fails on a bug.
        match HeaderValue::from_str(disposition) {
            Ok(value) => {
                resp_headers.insert(header::CONTENT_DISPOSITION, value);
            }
            Err(err) => tracing::error!("invalid content disposition {:?}: {}", disposition, err),
        }
    }
    Ok(response)
}
