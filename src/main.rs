use anyhow::{Context, Result};
use attachments::{
    config::{AppConfig, StorageBackend},
    db,
    services::{
        blob_storage::{BlobStorage, LocalBlobStorage, MemoryBlobStorage},
        events::{EventBus, LogSubscriber},
        property_schema::{PropertySchema, StaticPropertySchema},
        session_engine::SessionEngine,
        staging::StagingArea,
        virus_scan::ClamAvScanner,
    },
};
use sqlx::SqlitePool;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting attachments with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let engine = build_engine(&cfg, db).await?;
    engine
        .staging()
        .ensure_dir()
        .await
        .with_context(|| format!("creating staging directory {}", engine.staging().dir().display()))?;

    // --- Build router ---
    let app = attachments::app(engine, cfg.body_limit());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_engine(cfg: &AppConfig, db: Arc<SqlitePool>) -> Result<SessionEngine> {
    let storage: Arc<dyn BlobStorage> = match cfg.storage_backend {
        StorageBackend::Local => {
            tokio::fs::create_dir_all(&cfg.storage_dir)
                .await
                .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
            tracing::info!("Storing attachments under {}", cfg.storage_dir);
            Arc::new(LocalBlobStorage::new(&cfg.storage_dir))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory attachment storage; contents are lost on exit");
            Arc::new(MemoryBlobStorage::new())
        }
    };

    let schema: Arc<dyn PropertySchema> = match &cfg.property_schema {
        Some(path) => Arc::new(StaticPropertySchema::from_file(path).await?),
        None => Arc::new(StaticPropertySchema::default()),
    };

    let mut events = EventBus::new();
    events.subscribe(Arc::new(LogSubscriber));

    let mut engine = SessionEngine::new(
        db,
        storage,
        StagingArea::new(cfg.temp_dir.clone(), cfg.temp_dir_mode),
    )
    .with_validator(cfg.validator())
    .with_schema(schema)
    .with_events(events)
    .with_settings(cfg.engine_settings());

    if let Some(transport) = cfg.clamd_transport() {
        tracing::info!("Virus scanning enabled via {:?}", transport);
        engine = engine.with_scanner(Arc::new(ClamAvScanner::new(transport, cfg.clamd_timeout_secs)));
    }
    Ok(engine)
}
