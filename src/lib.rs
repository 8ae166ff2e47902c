//! Upload sessions that stage, validate and scan files, and commit them as
//! permanent attachments of arbitrary owner objects.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::session_engine::SessionEngine;

/// Router with state attached, ready to serve.
pub fn app(engine: SessionEngine, upload_limit: usize) -> Router {
    routes::routes::routes(upload_limit).with_state(engine)
}
