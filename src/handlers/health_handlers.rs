//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> SQLite reachability and a staging directory round trip

use crate::services::session_engine::SessionEngine;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, 503 otherwise. The body lists each check.
pub async fn readyz(State(engine): State<SessionEngine>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(engine.db())
        .await
    {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {}", v)),
        Err(e) => Err(format!("error: {}", e)),
    };

    let staging = match engine.staging().ensure_dir().await {
        Ok(()) => check_dir_writable(engine.staging().dir()).await,
        Err(e) => Err(format!("could not create staging dir: {}", e)),
    };

    let mut checks = BTreeMap::new();
    checks.insert("sqlite", CheckStatus::from_result(sqlite));
    checks.insert("staging", CheckStatus::from_result(staging));

    let ready = checks.values().all(|check| check.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ok" } else { "error" },
            checks,
        }),
    )
}

/// Write, read back and remove a small file in `dir`.
async fn check_dir_writable(dir: &Path) -> Result<(), String> {
    let marker = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&marker, b"readyz")
        .await
        .map_err(|e| format!("could not write marker file: {}", e))?;

    let read = fs::read(&marker).await;
    let removed = fs::remove_file(&marker).await;
    match read {
        Ok(bytes) if bytes == b"readyz" => {}
        Ok(_) => return Err("marker file content mismatch".into()),
        Err(e) => return Err(format!("could not read marker file: {}", e)),
    }
    removed.map_err(|e| format!("could not remove marker file: {}", e))
}
