//! `POST /sessions/{session_id}/uploads`.
//!
//! Every outcome except an unknown session is reported with HTTP 200 and the
//! `ok` flag, so upload widgets only ever look at the body.

use super::actor;
use crate::{
    errors::AppError,
    models::{Metadata, upload::Upload},
    services::session_engine::{Accepted, EngineError, IncomingFile, SessionEngine},
};
use crate::services::staging::StagingArea;
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde_json::{Value, json};
use std::{
    io,
    path::{Path as FsPath, PathBuf},
};
use thiserror::Error;
use tokio_util::io::StreamReader;

/// Multipart field carrying the file.
pub const FILE_FIELD: &str = "attachment";

/// Legacy iframe transports send this field with the value `IFrame`.
const REQUESTED_WITH_FIELD: &str = "X-Requested-With";

#[derive(Default)]
struct UploadForm {
    /// Submitted filename and the temp file holding the bytes.
    file: Option<(String, PathBuf)>,
    fields: Metadata,
    iframe: bool,
}

#[derive(Debug, Error)]
enum FormError {
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("failed to spool upload: {0}")]
    Io(#[from] io::Error),
}

/// Read the form, spooling the file field into the staging directory as it
/// arrives. On error nothing is left behind.
async fn read_form(multipart: &mut Multipart, staging: &StagingArea) -> Result<UploadForm, FormError> {
    let mut form = UploadForm::default();
    let result = read_fields(multipart, staging, &mut form).await;
    if result.is_err() {
        if let Some((_, path)) = form.file.take() {
            remove_spooled(staging, &path).await;
        }
    }
    result.map(|()| form)
}

async fn read_fields(
    multipart: &mut Multipart,
    staging: &StagingArea,
    form: &mut UploadForm,
) -> Result<(), FormError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILE_FIELD {
            let filename = field.file_name().unwrap_or_default().to_string();
            let mut reader = StreamReader::new(Box::pin(field.map_err(io::Error::other)));
            let (path, _) = staging.stage(&mut reader).await?;
            if let Some((_, previous)) = form.file.replace((filename, path)) {
                remove_spooled(staging, &previous).await;
            }
        } else if name == REQUESTED_WITH_FIELD {
            form.iframe = field.text().await? == "IFrame";
        } else if !name.is_empty() {
            let value = field.text().await?;
            form.fields.entry(name).or_default().push(value);
        }
    }
    Ok(())
}

async fn remove_spooled(staging: &StagingArea, path: &FsPath) {
    if let Err(err) = staging.remove(path).await {
        tracing::error!("failed to remove spooled upload {}: {}", path.display(), err);
    }
}

/// JSON body with the content type switched to `text/plain` for iframe uploads,
/// which would otherwise prompt a download in old browsers.
fn respond(status: StatusCode, body: Value, iframe: bool) -> Response {
    let mut response = (status, Json(body)).into_response();
    if iframe {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    response
}

fn respond_error(err: EngineError, iframe: bool) -> Response {
    let app = AppError::from(err);
    let status = if app.status == StatusCode::NOT_FOUND {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    respond(status, json!({ "ok": false, "error": app.message }), iframe)
}

fn file_summary(upload: &Upload) -> Value {
    json!({
        "id": upload.id,
        "file_name": upload.original_filename,
        "file_size": upload.size_bytes,
    })
}

pub async fn upload(
    State(engine): State<SessionEngine>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut form = match read_form(&mut multipart, engine.staging()).await {
        Ok(form) => form,
        Err(err) => {
            tracing::debug!(session = %session_id, "unreadable upload form: {}", err);
            return respond(
                StatusCode::OK,
                json!({ "ok": false, "error": "The upload could not be read." }),
                false,
            );
        }
    };
    let spooled = form.file.take();
    let iframe = form.iframe;

    let response = match &spooled {
        Some((filename, path)) => {
            accept_spooled(&engine, &session_id, filename, path, &form.fields, &headers, iframe).await
        }
        None => match engine.get_session(&session_id).await {
            Ok(_) => respond(
                StatusCode::OK,
                json!({ "ok": false, "error": "No file was submitted." }),
                iframe,
            ),
            Err(err) => respond_error(err, iframe),
        },
    };

    if let Some((_, path)) = &spooled {
        remove_spooled(engine.staging(), path).await;
    }
    response
}

async fn accept_spooled(
    engine: &SessionEngine,
    session_id: &str,
    filename: &str,
    path: &FsPath,
    fields: &Metadata,
    headers: &HeaderMap,
    iframe: bool,
) -> Response {
    let session = match engine.get_session(session_id).await {
        Ok(session) => session,
        Err(err) => return respond_error(err, iframe),
    };
    let incoming = match IncomingFile::from_path(filename, path).await {
        Ok(incoming) => incoming,
        Err(err) => return respond_error(EngineError::Io(err), iframe),
    };

    let actor = actor(headers);
    match engine.accept(&session, incoming, fields, actor.as_deref()).await {
        Ok(Accepted::Single(upload)) => respond(
            StatusCode::OK,
            json!({
                "ok": true,
                "file_name": upload.original_filename,
                "file_size": upload.size_bytes,
            }),
            iframe,
        ),
        Ok(Accepted::Archive(outcome)) => {
            let files: Vec<Value> = outcome.uploads.iter().map(file_summary).collect();
            let mut body = json!({
                "ok": outcome.ok(),
                "file_name": outcome.archive_name,
                "file_size": outcome.archive_size,
                "files": files,
            });
            if let Some(error) = outcome.error_message() {
                body["error"] = Value::String(error);
            }
            respond(StatusCode::OK, body, iframe)
        }
        Err(err) => respond_error(err, iframe),
    }
}
