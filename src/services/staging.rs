//! Temporary staging storage for uploads that have not been attached yet.
//!
//! Staged files live on local disk because the virus scanner needs a real path.
//! Each file gets a fresh uuid-derived name that is never reused.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const DIGEST_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
    /// Permission bits applied to the directory when it is created (e.g. 0o1777).
    dir_mode: Option<u32>,
}

impl StagingArea {
    /// `dir` defaults to `<system temp>/attachments`.
    pub fn new(dir: Option<PathBuf>, dir_mode: Option<u32>) -> Self {
        Self {
            dir: dir.unwrap_or_else(|| std::env::temp_dir().join("attachments")),
            dir_mode,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the staging directory if needed and apply the configured mode.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        if fs::try_exists(&self.dir).await? {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;
        if let Some(mode) = self.dir_mode {
            set_mode(&self.dir, mode).await?;
            debug!("created staging directory {} with mode {:o}", self.dir.display(), mode);
        }
        Ok(())
    }

    /// Copy the whole reader into a new staged file. The file is removed again if
    /// the copy fails part way.
    pub async fn stage(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<(PathBuf, u64)> {
        self.ensure_dir().await?;
        let path = self.dir.join(format!("upload-{}", Uuid::new_v4().simple()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let result = async {
            let written = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => Ok((path, written)),
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    pub async fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path).await
    }

    /// Hex MD5 of a staged file, read in chunks.
    pub async fn digest(&self, path: &Path) -> io::Result<String> {
        let mut file = self.open(path).await?;
        let mut context = md5::Context::new();
        let mut buf = vec![0u8; DIGEST_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    }

    /// Remove a staged file. Returns false when it was already gone.
    pub async fn remove(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("staged file {} already missing", path.display());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Move a staged file into `quarantine_dir`, keeping its staged name.
    /// Falls back to copy and delete when a rename is not possible (e.g. the
    /// quarantine lives on another filesystem).
    pub async fn quarantine(&self, path: &Path, quarantine_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(quarantine_dir).await?;
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "staged path has no file name"))?;
        let dest = quarantine_dir.join(name);
        if let Err(err) = fs::rename(path, &dest).await {
            warn!(
                "rename into quarantine failed ({}), copying {} instead",
                err,
                path.display()
            );
            fs::copy(path, &dest).await?;
            fs::remove_file(path).await?;
        }
        Ok(dest)
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Parse an octal mode such as `1777` or `0o1777`.
pub fn parse_mode(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0o")
        .or_else(|| trimmed.strip_prefix("0O"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 8).ok()
}
