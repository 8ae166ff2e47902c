//! The upload session state machine.
//!
//! `SessionEngine` owns every collaborator (stores, blob storage, staging area,
//! validator, optional virus scanner, property schema, access policy and event
//! bus) and is cheap to clone, so the HTTP layer uses it directly as router state.
//!
//! Ordering rules kept by every operation:
//! - an Upload row is created only after its bytes are staged and scanned;
//! - staged bytes are removed before the row that points at them;
//! - Attachment rows are created only after their permanent copies are verified;
//! - events are published only after the change they describe is committed.

use super::{
    access::{AccessPolicy, IdentifiedCallers},
    archive::{self, ArchiveEntry, ArchiveError},
    attachment_store::AttachmentStore,
    blob_storage::{BlobError, BlobReader, BlobStorage},
    download::{Download, DownloadBody, content_disposition, download_content_type},
    events::{AttachmentEvent, EventBus},
    property_schema::{FieldErrors, PropertySchema, StaticPropertySchema, extract_prefixed, validate_prefixed},
    session_store::{NewSession, SessionStore, StoreError},
    sniff::SNIFF_LEN,
    staging::StagingArea,
    validator::{UploadValidator, ValidationError, sanitize_filename},
    virus_scan::{ScanError, VirusScanner},
};
use crate::models::{
    Metadata,
    attachment::{Attachment, NewAttachment, OwnerRef},
    session::{Session, ValidationPolicy},
    upload::Upload,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::SqlitePool;
use std::{
    io::{self, Cursor, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

/// The only message callers ever see for internal failures.
pub const GENERIC_ERROR: &str = "An error occurred attaching file to the session.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("A virus was detected in {filename}, could not upload.")]
    VirusFound { filename: String, threat: String },
    #[error("{0} is empty.")]
    EmptyArchive(String),
    #[error("{0}")]
    InvalidArchive(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("upload not found")]
    UploadNotFound,
    #[error("attachment not found")]
    AttachmentNotFound,
    #[error("Please correct the errors below.")]
    InvalidProperties(FieldErrors),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("property schema unavailable: {0:#}")]
    Schema(anyhow::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::SessionNotFound
                | EngineError::UploadNotFound
                | EngineError::AttachmentNotFound
        )
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_)
                | EngineError::Blob(_)
                | EngineError::Io(_)
                | EngineError::Scan(_)
                | EngineError::Schema(_)
        )
    }

    /// Text that is safe to hand back to the caller.
    pub fn caller_message(&self) -> String {
        if self.is_internal() {
            GENERIC_ERROR.to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<ArchiveError> for EngineError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Empty(name) => EngineError::EmptyArchive(name),
            unreadable @ ArchiveError::Unreadable { .. } => {
                EngineError::InvalidArchive(unreadable.to_string())
            }
            ArchiveError::Io(err) => EngineError::Io(err),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A file on its way into a session: its client name, declared size, the first
/// bytes for content sniffing and a reader positioned at the start.
pub struct IncomingFile {
    pub filename: String,
    pub size: u64,
    pub sample: Vec<u8>,
    pub reader: BlobReader,
}

impl IncomingFile {
    pub fn from_bytes(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        let sample = bytes[..bytes.len().min(SNIFF_LEN)].to_vec();
        Self {
            filename: filename.into(),
            size: bytes.len() as u64,
            sample,
            reader: Box::new(Cursor::new(bytes)),
        }
    }

    pub async fn from_path(filename: impl Into<String>, path: &Path) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let mut sample = Vec::with_capacity(SNIFF_LEN.min(size as usize));
        (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut sample).await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Self {
            filename: filename.into(),
            size,
            sample,
            reader: Box::new(file),
        })
    }
}

/// What a session minted by [`SessionEngine::resolve_session`] should look like.
/// Unset policy fields fall back to the configured defaults.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    pub owner: Option<String>,
    pub scope: String,
    pub target_kind: Option<String>,
    pub allowed_extensions: Option<String>,
    pub allowed_file_types: Option<String>,
    pub expand_archives: Option<bool>,
}

/// Result of expanding one archive. Successful entries stay staged even when
/// others failed.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archive_name: String,
    pub archive_size: u64,
    pub uploads: Vec<Upload>,
    pub errors: Vec<String>,
}

impl ArchiveOutcome {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub enum Accepted {
    Single(Upload),
    Archive(ArchiveOutcome),
}

pub type PathFn = Arc<dyn Fn(&Upload, &Session, &OwnerRef) -> String + Send + Sync>;
pub type MetadataFn = Arc<dyn Fn(&Upload, &Session) -> Metadata + Send + Sync>;

/// Hooks for [`SessionEngine::attach_with`]. `None` means the default behavior.
#[derive(Clone, Default)]
pub struct AttachOptions {
    pub path_fn: Option<PathFn>,
    pub metadata_fn: Option<MetadataFn>,
}

/// Input for [`SessionEngine::attach_raw`].
#[derive(Clone, Debug)]
pub struct RawAttach {
    pub owner: OwnerRef,
    pub uploaded_by: Option<String>,
    pub scope: String,
    /// Permanent path; derived from owner, scope and filename when absent.
    pub path: Option<String>,
    pub properties: Metadata,
}

/// Default permanent location: owner type split on `.`, then owner id, scope and
/// filename, skipping empty segments (`crm/contact/7/avatar/me.png`).
pub fn default_attachment_path(owner: &OwnerRef, scope: &str, filename: &str) -> String {
    owner
        .owner_type
        .split('.')
        .chain([owner.owner_id.as_str(), scope, filename])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Clone, Debug, Default)]
pub struct EngineSettings {
    /// Policy for sessions that do not override it.
    pub default_policy: ValidationPolicy,
    /// Infected files are moved here; deleted when unset.
    pub quarantine_dir: Option<PathBuf>,
    /// Always send `Content-Disposition`, even when the URL names the file.
    pub always_download: bool,
    /// Hand local files to the front server via `X-Sendfile`.
    pub use_sendfile: bool,
}

#[derive(Clone)]
pub struct SessionEngine {
    db: Arc<SqlitePool>,
    sessions: SessionStore,
    attachments: AttachmentStore,
    storage: Arc<dyn BlobStorage>,
    staging: StagingArea,
    validator: Arc<UploadValidator>,
    scanner: Option<Arc<dyn VirusScanner>>,
    schema: Arc<dyn PropertySchema>,
    access: Arc<dyn AccessPolicy>,
    events: Arc<EventBus>,
    settings: Arc<EngineSettings>,
}

impl SessionEngine {
    pub fn new(db: Arc<SqlitePool>, storage: Arc<dyn BlobStorage>, staging: StagingArea) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            attachments: AttachmentStore::new(db.clone()),
            db,
            storage,
            staging,
            validator: Arc::new(UploadValidator::default()),
            scanner: None,
            schema: Arc::new(StaticPropertySchema::default()),
            access: Arc::new(IdentifiedCallers),
            events: Arc::new(EventBus::new()),
            settings: Arc::new(EngineSettings::default()),
        }
    }

    pub fn with_validator(mut self, validator: UploadValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn VirusScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn PropertySchema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }


    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Return the session behind `token`, or mint a new one when no token was
    /// presented or it no longer exists.
    pub async fn resolve_session(
        &self,
        token: Option<&str>,
        request: &SessionRequest,
    ) -> EngineResult<Session> {
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(session) = self.sessions.get(token).await? {
                return Ok(session);
            }
            tracing::debug!(session = %token, "presented session token is unknown, minting a new one");
        }

        let new = NewSession {
            owner: request.owner.clone(),
            target_kind: request.target_kind.clone(),
            scope: request.scope.clone(),
            policy: self.settings.default_policy.with_overrides(
                request.allowed_extensions.as_deref(),
                request.allowed_file_types.as_deref(),
                request.expand_archives,
            ),
        };
        let session = self.sessions.create(&new).await?;
        tracing::info!(session = %session.id, scope = %session.scope, "created attachment session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(EngineError::SessionNotFound)
    }

    /// Uploads of a session in creation order.
    pub async fn list_uploads(&self, session_id: &str) -> EngineResult<Vec<Upload>> {
        Ok(self.sessions.list_uploads(session_id).await?)
    }

    /// Merge form values into the session metadata without uploading anything.
    pub async fn merge_metadata(&self, session_id: &str, values: &Metadata) -> EngineResult<()> {
        if self.sessions.merge_metadata(session_id, values).await? {
            Ok(())
        } else {
            Err(EngineError::SessionNotFound)
        }
    }

    /// Check every upload's `upload-<id>-<slug>` values against the property
    /// definitions for the session's target kind.
    pub async fn validate_session(&self, session: &Session) -> EngineResult<()> {
        let Some(kind) = session.target_kind.as_deref() else {
            return Ok(());
        };
        let definitions = self
            .schema
            .properties_for(kind)
            .await
            .map_err(EngineError::Schema)?;
        if definitions.is_empty() {
            return Ok(());
        }

        let mut errors = FieldErrors::new();
        for upload in self.sessions.list_uploads(&session.id).await? {
            errors.extend(validate_prefixed(
                &definitions,
                &upload.field_prefix(),
                &session.metadata.0,
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidProperties(errors))
        }
    }

    /// Delete a session, its uploads and their staged bytes.
    pub async fn abandon(&self, session_id: &str) -> EngineResult<()> {
        let session = self.get_session(session_id).await?;
        let uploads = self.sessions.list_uploads(&session.id).await?;
        self.remove_staged(&uploads).await?;
        self.sessions.delete(&session.id).await?;
        tracing::info!(session = %session.id, uploads = uploads.len(), "session abandoned");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    /// Entry point for every incoming file: archives are expanded when the
    /// session asks for it, everything else goes through [`Self::accept_upload`].
    pub async fn accept(
        &self,
        session: &Session,
        file: IncomingFile,
        raw_metadata: &Metadata,
        actor: Option<&str>,
    ) -> EngineResult<Accepted> {
        if session.policy.expand_archives && archive::is_archive(&file.filename) {
            let outcome = self.accept_archive(session, file, raw_metadata, actor).await?;
            Ok(Accepted::Archive(outcome))
        } else {
            let upload = self.accept_upload(session, file, raw_metadata, actor).await?;
            Ok(Accepted::Single(upload))
        }
    }

    /// Validate, stage, scan and record one file, then merge `raw_metadata`
    /// into the session.
    pub async fn accept_upload(
        &self,
        session: &Session,
        file: IncomingFile,
        raw_metadata: &Metadata,
        actor: Option<&str>,
    ) -> EngineResult<Upload> {
        let submitted_filename = file.filename.clone();
        let upload = self.stage_validated(session, file, actor).await?;
        self.merge_metadata(&session.id, raw_metadata).await?;
        self.events.publish(AttachmentEvent::UploadAccepted {
            session_id: session.id.clone(),
            upload: upload.clone(),
            submitted_filename,
        });
        Ok(upload)
    }

    /// Expand a zip and run every entry through the single-file pipeline.
    ///
    /// Entry failures are collected, not short-circuited, and entries that
    /// passed stay staged. An archive without file entries fails as a whole.
    pub async fn accept_archive(
        &self,
        session: &Session,
        mut file: IncomingFile,
        raw_metadata: &Metadata,
        actor: Option<&str>,
    ) -> EngineResult<ArchiveOutcome> {
        let archive_name = sanitize_filename(&file.filename)?;
        self.validator.check_size(&archive_name, file.size)?;

        let (archive_path, archive_size) = self.staging.stage(&mut *file.reader).await?;
        let extracted = archive::extract(
            &archive_path,
            &archive_name,
            self.staging.dir(),
            self.validator.max_file_size,
        )
        .await;
        self.discard_staged(&archive_path).await;
        let extraction = extracted?;

        let mut outcome = ArchiveOutcome {
            archive_name,
            archive_size,
            uploads: Vec::new(),
            errors: Vec::new(),
        };

        for entry in &extraction.entries {
            match entry {
                ArchiveEntry::Nested { name } => {
                    outcome
                        .errors
                        .push(format!("{}: nested zip files are not supported.", name));
                }
                ArchiveEntry::TooLarge { name, size } => {
                    if let Err(err) = self.validator.check_size(name, *size) {
                        outcome.errors.push(err.to_string());
                    }
                }
                ArchiveEntry::File { name, path, .. } => {
                    let result = match IncomingFile::from_path(name.clone(), path).await {
                        Ok(incoming) => self.stage_validated(session, incoming, actor).await,
                        Err(err) => Err(EngineError::Io(err)),
                    };
                    match result {
                        Ok(upload) => outcome.uploads.push(upload),
                        Err(err) => {
                            if err.is_internal() {
                                tracing::error!(
                                    session = %session.id,
                                    entry = %name,
                                    error = ?err,
                                    "failed to stage archive entry"
                                );
                            }
                            outcome.errors.push(err.caller_message());
                        }
                    }
                }
            }
        }
        extraction.cleanup().await;

        if !outcome.uploads.is_empty() {
            self.merge_metadata(&session.id, raw_metadata).await?;
            for upload in &outcome.uploads {
                self.events.publish(AttachmentEvent::UploadAccepted {
                    session_id: session.id.clone(),
                    upload: upload.clone(),
                    submitted_filename: upload.original_filename.clone(),
                });
            }
        }

        tracing::info!(
            session = %session.id,
            archive = %outcome.archive_name,
            staged = outcome.uploads.len(),
            failed = outcome.errors.len(),
            "archive expanded"
        );
        Ok(outcome)
    }

    /// Remove one upload from its session. Uploads of other sessions are not found.
    pub async fn delete_upload(&self, session_id: &str, upload_id: i64) -> EngineResult<()> {
        let upload = self
            .sessions
            .get_upload(session_id, upload_id)
            .await?
            .ok_or(EngineError::UploadNotFound)?;
        self.staging.remove(Path::new(&upload.staged_path)).await?;
        self.sessions.delete_upload(upload.id).await?;
        tracing::debug!(session = %session_id, upload_id, "upload deleted");
        Ok(())
    }

    async fn stage_validated(
        &self,
        session: &Session,
        mut file: IncomingFile,
        actor: Option<&str>,
    ) -> EngineResult<Upload> {
        let uploaded_at = Utc::now();
        let filename = self
            .validator
            .validate(&session.policy, &file.filename, &file.sample, file.size)?;

        let (staged_path, written) = self.staging.stage(&mut *file.reader).await?;

        // The declared size may understate what actually arrived.
        if let Err(err) = self.validator.check_size(&filename, written) {
            self.discard_staged(&staged_path).await;
            return Err(err.into());
        }

        if let Some(scanner) = &self.scanner {
            match scanner.scan(&staged_path).await {
                Ok(None) => {}
                Ok(Some(threat)) => {
                    return Err(self
                        .reject_infected(&staged_path, filename, threat, actor, uploaded_at)
                        .await);
                }
                Err(err) => {
                    self.discard_staged(&staged_path).await;
                    return Err(err.into());
                }
            }
        }

        let staged = staged_path.to_string_lossy();
        match self
            .sessions
            .insert_upload(&session.id, &staged, &filename, written as i64)
            .await
        {
            Ok(upload) => Ok(upload),
            Err(err) => {
                self.discard_staged(&staged_path).await;
                Err(err.into())
            }
        }
    }

    async fn reject_infected(
        &self,
        staged_path: &Path,
        filename: String,
        threat: String,
        actor: Option<&str>,
        uploaded_at: DateTime<Utc>,
    ) -> EngineError {
        let quarantine_path = match &self.settings.quarantine_dir {
            Some(dir) => match self.staging.quarantine(staged_path, dir).await {
                Ok(moved) => Some(moved),
                Err(err) => {
                    tracing::error!(
                        "could not quarantine {} into {}: {}",
                        staged_path.display(),
                        dir.display(),
                        err
                    );
                    self.discard_staged(staged_path).await;
                    None
                }
            },
            None => {
                self.discard_staged(staged_path).await;
                None
            }
        };

        let user = actor.unwrap_or("unknown").to_string();
        tracing::warn!(
            user = %user,
            file = %filename,
            threat = %threat,
            quarantine = ?quarantine_path,
            "virus found in upload, rejected"
        );
        self.events.publish(AttachmentEvent::VirusDetected {
            user,
            filename: filename.clone(),
            threat: threat.clone(),
            time_of_upload: uploaded_at,
            quarantine_path,
        });
        EngineError::VirusFound { filename, threat }
    }

    /// Best-effort removal of a staged file that never became an Upload.
    async fn discard_staged(&self, path: &Path) {
        if let Err(err) = self.staging.remove(path).await {
            tracing::error!("failed to remove staged file {}: {}", path.display(), err);
        }
    }

    async fn remove_staged(&self, uploads: &[Upload]) -> EngineResult<()> {
        let results = join_all(
            uploads
                .iter()
                .map(|upload| self.staging.remove(Path::new(&upload.staged_path))),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Attach
    // ---------------------------------------------------------------------

    pub async fn attach(&self, session_id: &str, owner: &OwnerRef) -> EngineResult<Vec<Attachment>> {
        self.attach_with(session_id, owner, &AttachOptions::default()).await
    }

    /// Commit every upload of the session to `owner` and discard the session.
    ///
    /// The session is claimed first, so overlapping calls for one session
    /// commit at most once; the losers see `SessionNotFound`. Phase one copies
    /// each upload to its permanent path and verifies size and digest. Phase two
    /// inserts all attachment rows and deletes the session in one transaction.
    /// A failure in either phase removes the copies made so far, releases the
    /// claim and leaves the session untouched, so the call can be retried.
    pub async fn attach_with(
        &self,
        session_id: &str,
        owner: &OwnerRef,
        options: &AttachOptions,
    ) -> EngineResult<Vec<Attachment>> {
        let session = self.get_session(session_id).await?;
        if !self.sessions.claim_for_attach(&session.id).await? {
            tracing::debug!(session = %session.id, "session is already being attached");
            return Err(EngineError::SessionNotFound);
        }

        let uploads = match self.sessions.list_uploads(&session.id).await {
            Ok(uploads) => uploads,
            Err(err) => {
                self.release_claim(&session.id).await;
                return Err(err.into());
            }
        };
        let attachments = match self.commit_uploads(&session, &uploads, owner, options).await {
            Ok(attachments) => attachments,
            Err(err) => {
                self.release_claim(&session.id).await;
                return Err(err);
            }
        };

        self.events.publish(AttachmentEvent::Attached {
            owner: owner.clone(),
            attachments: attachments.clone(),
        });

        // The attachments are committed; a failed cleanup must not report failure.
        if let Err(err) = self.remove_staged(&uploads).await {
            tracing::error!(session = %session.id, error = ?err, "failed to remove staged uploads after attach");
        }

        tracing::info!(
            session = %session.id,
            owner_type = %owner.owner_type,
            owner_id = %owner.owner_id,
            count = attachments.len(),
            "session attached"
        );
        Ok(attachments)
    }

    async fn commit_uploads(
        &self,
        session: &Session,
        uploads: &[Upload],
        owner: &OwnerRef,
        options: &AttachOptions,
    ) -> EngineResult<Vec<Attachment>> {
        let mut copied: Vec<String> = Vec::with_capacity(uploads.len());
        let mut records = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let path = match &options.path_fn {
                Some(path_fn) => path_fn(upload, session, owner),
                None => default_attachment_path(owner, &session.scope, &upload.original_filename),
            };
            let stored_path = match self.copy_to_storage(upload, &path).await {
                Ok(stored_path) => stored_path,
                Err(err) => {
                    self.discard_copies(&copied).await;
                    return Err(err);
                }
            };
            copied.push(stored_path.clone());

            let properties = match &options.metadata_fn {
                Some(metadata_fn) => metadata_fn(upload, session),
                None => extract_prefixed(&session.metadata.0, &upload.field_prefix()),
            };
            records.push(NewAttachment {
                storage_path: stored_path,
                original_filename: upload.original_filename.clone(),
                size_bytes: upload.size_bytes,
                owner: owner.clone(),
                uploaded_by: session.owner.clone(),
                scope: session.scope.clone(),
                properties,
            });
        }

        match self.attachments.commit_session(&session.id, &records).await {
            Ok(Some(attachments)) => Ok(attachments),
            Ok(None) => {
                self.discard_copies(&copied).await;
                Err(EngineError::SessionNotFound)
            }
            Err(err) => {
                self.discard_copies(&copied).await;
                Err(err.into())
            }
        }
    }

    async fn release_claim(&self, session_id: &str) {
        if let Err(err) = self.sessions.release_claim(session_id).await {
            tracing::error!(session = %session_id, error = ?err, "failed to release attach claim");
        }
    }

    /// Copy one staged upload into blob storage and return where it landed.
    /// The copy must match the staged bytes in size and MD5.
    async fn copy_to_storage(&self, upload: &Upload, path: &str) -> EngineResult<String> {
        let staged_path = Path::new(&upload.staged_path);
        let mut staged = self.staging.open(staged_path).await?;
        let stored = self.storage.save(path, &mut staged).await?;

        let stored_size = self.storage.size(&stored.path).await?;
        let mismatch = if stored_size != upload.size_bytes as u64 {
            Some(format!("{} bytes, expected {}", stored_size, upload.size_bytes))
        } else {
            let expected = self.staging.digest(staged_path).await?;
            (stored.md5 != expected).then(|| format!("md5 {}, expected {}", stored.md5, expected))
        };
        if let Some(mismatch) = mismatch {
            self.discard_copies(std::slice::from_ref(&stored.path)).await;
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("copy of upload {} is corrupt: {}", upload.id, mismatch),
            )));
        }
        Ok(stored.path)
    }

    async fn discard_copies(&self, paths: &[String]) {
        for path in paths {
            if let Err(err) = self.storage.delete_if_exists(path).await {
                tracing::error!("failed to remove blob {} after aborted attach: {}", path, err);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------------

    /// Store a file straight to permanent storage without a session.
    pub async fn attach_raw(&self, mut file: IncomingFile, raw: RawAttach) -> EngineResult<Attachment> {
        let filename = sanitize_filename(&file.filename)?;
        let path = raw
            .path
            .clone()
            .unwrap_or_else(|| default_attachment_path(&raw.owner, &raw.scope, &filename));

        let stored = self.storage.save(&path, &mut *file.reader).await?;
        let record = NewAttachment {
            storage_path: stored.path.clone(),
            original_filename: filename,
            size_bytes: stored.size as i64,
            owner: raw.owner.clone(),
            uploaded_by: raw.uploaded_by,
            scope: raw.scope,
            properties: raw.properties,
        };
        let attachment = match self.attachments.insert(&record).await {
            Ok(attachment) => attachment,
            Err(err) => {
                self.discard_copies(std::slice::from_ref(&stored.path)).await;
                return Err(err.into());
            }
        };

        self.events.publish(AttachmentEvent::Attached {
            owner: raw.owner,
            attachments: vec![attachment.clone()],
        });
        Ok(attachment)
    }

    pub async fn get_attachment(&self, id: i64) -> EngineResult<Attachment> {
        self.attachments
            .get(id)
            .await?
            .ok_or(EngineError::AttachmentNotFound)
    }

    /// Attachments of `owner` the actor may access.
    pub async fn list_attachments(
        &self,
        owner: &OwnerRef,
        actor: Option<&str>,
    ) -> EngineResult<Vec<Attachment>> {
        let mut attachments = self.attachments.list_for_owner(owner).await?;
        attachments.retain(|attachment| self.access.can_access(actor, attachment));
        Ok(attachments)
    }

    /// Fetch an attachment the actor may access. Denials look like not-found.
    pub async fn accessible_attachment(&self, id: i64, actor: Option<&str>) -> EngineResult<Attachment> {
        let attachment = self.get_attachment(id).await?;
        if !self.access.can_access(actor, &attachment) {
            tracing::debug!(attachment_id = id, actor = ?actor, "attachment access denied");
            return Err(EngineError::AttachmentNotFound);
        }
        Ok(attachment)
    }

    /// Remove the blob (a missing one is fine) and then the record.
    pub async fn delete_attachment(&self, id: i64) -> EngineResult<()> {
        let attachment = self.get_attachment(id).await?;
        if !self.storage.delete_if_exists(&attachment.storage_path).await? {
            tracing::warn!(attachment_id = id, path = %attachment.storage_path, "attachment blob was already missing");
        }
        self.attachments.delete(id).await?;
        Ok(())
    }

    /// Validate `attachment-<id>-<slug>` form values against the schema for the
    /// attachment's owner type and replace its properties with them.
    pub async fn update_properties(
        &self,
        id: i64,
        actor: Option<&str>,
        form: &Metadata,
    ) -> EngineResult<Attachment> {
        let mut attachment = self.accessible_attachment(id, actor).await?;
        let prefix = attachment.field_prefix();

        let definitions = self
            .schema
            .properties_for(&attachment.owner_type)
            .await
            .map_err(EngineError::Schema)?;
        let errors = validate_prefixed(&definitions, &prefix, form);
        if !errors.is_empty() {
            return Err(EngineError::InvalidProperties(errors));
        }

        let properties = extract_prefixed(form, &prefix);
        if !self.attachments.update_properties(id, &properties).await? {
            return Err(EngineError::AttachmentNotFound);
        }
        attachment.properties.0 = properties;
        Ok(attachment)
    }

    /// Prepare a download. `url_filename` is the filename segment of the request
    /// URL, if any; without one the response always carries a disposition.
    pub async fn open_download(
        &self,
        id: i64,
        actor: Option<&str>,
        url_filename: Option<&str>,
    ) -> EngineResult<Download> {
        let attachment = self.accessible_attachment(id, actor).await?;
        self.events.publish(AttachmentEvent::Downloaded {
            attachment_id: attachment.id,
            actor: actor.map(str::to_string),
        });

        let url_filename = url_filename.filter(|name| !name.is_empty());
        let disposition = if self.settings.always_download || url_filename.is_none() {
            Some(content_disposition(
                url_filename.unwrap_or(&attachment.original_filename),
            ))
        } else {
            None
        };

        // Not every backend can report a size.
        let content_length = match self.storage.size(&attachment.storage_path).await {
            Ok(size) => Some(size),
            Err(BlobError::NotFound(_)) => {
                tracing::warn!(attachment_id = id, path = %attachment.storage_path, "attachment blob is missing");
                return Err(EngineError::AttachmentNotFound);
            }
            Err(err) => {
                tracing::debug!(attachment_id = id, "blob size unavailable: {}", err);
                None
            }
        };

        let local = if self.settings.use_sendfile {
            self.storage.local_path(&attachment.storage_path)
        } else {
            None
        };
        let body = match local {
            Some(path) => DownloadBody::Sendfile(path),
            None => match self.storage.open(&attachment.storage_path).await {
                Ok(reader) => DownloadBody::Stream(reader),
                Err(BlobError::NotFound(_)) => return Err(EngineError::AttachmentNotFound),
                Err(err) => return Err(err.into()),
            },
        };

        Ok(Download {
            content_type: download_content_type(&attachment.original_filename),
            content_length,
            disposition,
            body,
            attachment,
        })
    }
}
