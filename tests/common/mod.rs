#![allow(dead_code)]

use async_trait::async_trait;
use attachments::{
    db,
    models::{Metadata, session::Session},
    services::{
        blob_storage::MemoryBlobStorage,
        events::{AttachmentEvent, EventBus, EventSubscriber},
        session_engine::{EngineSettings, SessionEngine, SessionRequest},
        staging::StagingArea,
        validator::{DEFAULT_MAX_FILE_SIZE, UploadValidator},
        virus_scan::{ScanError, VirusScanner},
    },
};
use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tempfile::TempDir;

pub const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n%%EOF\n";
pub const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// Reports any file containing the EICAR marker, fails on files containing `SCAN-FAIL`.
pub struct FakeScanner;

#[async_trait]
impl VirusScanner for FakeScanner {
    async fn scan(&self, path: &Path) -> Result<Option<String>, ScanError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ScanError::Failed(e.to_string()))?;
        let contains = |needle: &[u8]| data.windows(needle.len()).any(|w| w == needle);
        if contains(b"SCAN-FAIL") {
            return Err(ScanError::Failed("clamd went away".into()));
        }
        if contains(b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE") {
            return Ok(Some("Eicar-Test-Signature".into()));
        }
        Ok(None)
    }
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<AttachmentEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<AttachmentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl EventSubscriber for Recorder {
    fn on_event(&self, event: &AttachmentEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub engine: SessionEngine,
    pub storage: Arc<MemoryBlobStorage>,
    pub recorder: Arc<Recorder>,
    pub staging_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    _tmp: TempDir,
}

pub struct HarnessBuilder {
    settings: EngineSettings,
    mime_overrides: HashMap<String, Vec<String>>,
    max_file_size: Option<u64>,
    scanner: bool,
    quarantine: bool,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            settings: EngineSettings::default(),
            mime_overrides: HashMap::new(),
            max_file_size: Some(DEFAULT_MAX_FILE_SIZE),
            scanner: false,
            quarantine: false,
        }
    }
}

impl HarnessBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mime_overrides(mut self, overrides: HashMap<String, Vec<String>>) -> Self {
        self.mime_overrides = overrides;
        self
    }

    pub fn scanner(mut self) -> Self {
        self.scanner = true;
        self
    }

    pub fn quarantine(mut self) -> Self {
        self.quarantine = true;
        self
    }

    pub async fn build(self) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let staging_dir = tmp.path().join("staging");
        let quarantine_dir = tmp.path().join("quarantine");

        let pool = Arc::new(db::memory_pool().await.unwrap());
        let storage = Arc::new(MemoryBlobStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut events = EventBus::new();
        events.subscribe(recorder.clone());

        let mut settings = self.settings;
        if self.quarantine {
            settings.quarantine_dir = Some(quarantine_dir.clone());
        }

        let mut engine = SessionEngine::new(
            pool,
            storage.clone(),
            StagingArea::new(Some(staging_dir.clone()), None),
        )
        .with_validator(UploadValidator::new(self.max_file_size, self.mime_overrides))
        .with_events(events)
        .with_settings(settings);
        if self.scanner {
            engine = engine.with_scanner(Arc::new(FakeScanner));
        }

        Harness {
            engine,
            storage,
            recorder,
            staging_dir,
            quarantine_dir,
            _tmp: tmp,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub async fn session(&self, request: SessionRequest) -> Session {
        self.engine.resolve_session(None, &request).await.unwrap()
    }

    /// Files left in the staging directory, ignoring the directory itself.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn upload_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM uploads")
            .fetch_one(self.engine.db())
            .await
            .unwrap()
    }

    pub async fn attachment_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(self.engine.db())
            .await
            .unwrap()
    }
}

pub fn meta(pairs: &[(&str, &[&str])]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

/// Zip with the given entries. Names ending in `/` become directories.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}
