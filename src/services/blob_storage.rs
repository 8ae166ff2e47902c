//! src/services/blob_storage.rs
//!
//! Blob storage adapters for permanent attachment bytes. The engine only needs
//! save/open/delete/size by path, so backends stay swappable: local disk for
//! production, memory for tests and throwaway deployments.

use async_trait::async_trait;
use bytes::Bytes;
use md5::Context;
use std::{
    collections::HashMap,
    io::{self, Cursor, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Streamed blob contents.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob path `{0}`")]
    InvalidPath(String),
    #[error("no free name available for `{0}`")]
    NameExhausted(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Outcome of a save: where the bytes actually landed and what was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// May differ from the requested path when that one was taken.
    pub path: String,
    pub size: u64,
    pub md5: String,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store the reader's bytes at `path`, or at a free variant of it. Never
    /// overwrites an existing blob.
    async fn save(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BlobResult<StoredBlob>;

    async fn open(&self, path: &str) -> BlobResult<BlobReader>;

    /// Remove a blob. Returns `NotFound` when there is nothing to remove.
    async fn delete(&self, path: &str) -> BlobResult<()>;

    async fn size(&self, path: &str) -> BlobResult<u64>;

    async fn exists(&self, path: &str) -> BlobResult<bool>;

    /// Filesystem location of a blob, for backends that have one.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }

    /// Delete if present. A missing blob is not an error; anything else is.
    async fn delete_if_exists(&self, path: &str) -> BlobResult<bool> {
        match self.delete(path).await {
            Ok(()) => Ok(true),
            Err(BlobError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

const MAX_PATH_LEN: usize = 1024;
const MAX_NAME_ATTEMPTS: usize = 32;
const COPY_CHUNK: usize = 64 * 1024;

/// Reject paths that could escape the storage root.
fn ensure_path_safe(path: &str) -> BlobResult<()> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(BlobError::InvalidPath(path.to_string()));
    }
    if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
        return Err(BlobError::InvalidPath(path.to_string()));
    }
    if path
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(BlobError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Variant of `path` with a short digest-derived suffix before the extension,
/// e.g. `a/b/report_3f2a9c1.pdf`.
fn alternative_path(path: &str) -> String {
    let digest = md5::compute(format!("{}/{}", path, Uuid::new_v4()));
    let suffix = &format!("{:x}", digest)[..7];
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, suffix, ext),
        _ => format!("{}_{}", name, suffix),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}

/// Local-disk backend rooted at `base_path`.
#[derive(Clone, Debug)]
pub struct LocalBlobStorage {
    base_path: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> BlobResult<PathBuf> {
        ensure_path_safe(path)?;
        Ok(self.base_path.join(path))
    }

    /// Stream the reader into a hidden temp file next to `target`, returning the
    /// temp path, byte count and MD5. The temp file is removed on any error.
    async fn write_temp(
        &self,
        target: &Path,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BlobResult<(PathBuf, u64, String)> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let mut size: u64 = 0;
            let mut digest = Context::new();
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                size += n as u64;
                digest.consume(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>((size, format!("{:x}", digest.compute())))
        }
        .await;

        match result {
            Ok((size, md5)) => Ok((tmp_path, size, md5)),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(BlobError::Io(err))
            }
        }
    }

    /// Remove empty directories from `start` up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn save(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BlobResult<StoredBlob> {
        let first = self.full_path(path)?;
        let (tmp_path, size, md5) = self.write_temp(&first, reader).await?;

        // hard_link refuses to clobber, so two writers racing for one name both
        // end up with distinct blobs.
        let mut candidate = path.to_string();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let target = self.full_path(&candidate)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::hard_link(&tmp_path, &target).await {
                Ok(()) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    debug!(path = %candidate, size, "stored blob");
                    return Ok(StoredBlob {
                        path: candidate,
                        size,
                        md5,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    candidate = alternative_path(path);
                }
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            }
        }

        let _ = fs::remove_file(&tmp_path).await;
        Err(BlobError::NameExhausted(path.to_string()))
    }

    async fn open(&self, path: &str) -> BlobResult<BlobReader> {
        let full = self.full_path(path)?;
        match File::open(&full).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn delete(&self, path: &str) -> BlobResult<()> {
        let full = self.full_path(path)?;
        match fs::remove_file(&full).await {
            Ok(_) => debug!("removed blob {}", full.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(path.to_string()));
            }
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = full.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn size(&self, path: &str) -> BlobResult<u64> {
        let full = self.full_path(path)?;
        match fs::metadata(&full).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn exists(&self, path: &str) -> BlobResult<bool> {
        let full = self.full_path(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.full_path(path).ok()
    }
}

/// In-process backend. Contents vanish with the process.
#[derive(Clone, Default)]
pub struct MemoryBlobStorage {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths currently stored, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // A poisoned map still holds consistent entries; every mutation is a
        // single insert or remove.
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn save(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BlobResult<StoredBlob> {
        ensure_path_safe(path)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let md5 = format!("{:x}", md5::compute(&data));
        let size = data.len() as u64;

        let mut blobs = self.lock();
        let mut candidate = path.to_string();
        for _ in 0..MAX_NAME_ATTEMPTS {
            if !blobs.contains_key(&candidate) {
                blobs.insert(candidate.clone(), Bytes::from(data));
                return Ok(StoredBlob {
                    path: candidate,
                    size,
                    md5,
                });
            }
            candidate = alternative_path(path);
        }
        Err(BlobError::NameExhausted(path.to_string()))
    }

    async fn open(&self, path: &str) -> BlobResult<BlobReader> {
        let data = self
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, path: &str) -> BlobResult<()> {
        self.lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn size(&self, path: &str) -> BlobResult<u64> {
        self.lock()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> BlobResult<bool> {
        Ok(self.lock().contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(storage: &dyn BlobStorage, path: &str) -> Vec<u8> {
        let mut reader = storage.open(path).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        assert!(ensure_path_safe("a/b/c.txt").is_ok());
        assert!(ensure_path_safe("a/../../etc/passwd").is_err());
        assert!(ensure_path_safe("/abs").is_err());
        assert!(ensure_path_safe("").is_err());
        assert!(ensure_path_safe("a\\b").is_err());
        // Dots inside a name are fine.
        assert!(ensure_path_safe("a/b..c.txt").is_ok());
    }

    #[test]
    fn alternative_paths_keep_directory_and_extension() {
        let alt = alternative_path("crm/contact/1/report.pdf");
        assert!(alt.starts_with("crm/contact/1/report_"));
        assert!(alt.ends_with(".pdf"));
        assert_eq!(alt.len(), "crm/contact/1/report_.pdf".len() + 7);
        assert!(alternative_path("README").starts_with("README_"));
    }

    #[tokio::test]
    async fn local_save_open_size_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalBlobStorage::new(dir.path());

        let mut data: &[u8] = b"hello blob";
        let stored = storage.save("a/b/hello.txt", &mut data).await.unwrap();
        assert_eq!(stored.path, "a/b/hello.txt");
        assert_eq!(stored.size, 10);
        assert_eq!(stored.md5, format!("{:x}", md5::compute(b"hello blob")));

        assert_eq!(read_all(&storage, "a/b/hello.txt").await, b"hello blob");
        assert_eq!(storage.size("a/b/hello.txt").await.unwrap(), 10);
        assert!(storage.exists("a/b/hello.txt").await.unwrap());

        storage.delete("a/b/hello.txt").await.unwrap();
        assert!(!storage.exists("a/b/hello.txt").await.unwrap());
        // Emptied directories are pruned up to the root.
        assert!(!dir.path().join("a").exists());
        assert!(matches!(
            storage.delete("a/b/hello.txt").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(!storage.delete_if_exists("a/b/hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn local_save_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalBlobStorage::new(dir.path());

        let mut first: &[u8] = b"first";
        let mut second: &[u8] = b"second";
        let a = storage.save("x/report.pdf", &mut first).await.unwrap();
        let b = storage.save("x/report.pdf", &mut second).await.unwrap();
        assert_eq!(a.path, "x/report.pdf");
        assert_ne!(a.path, b.path);
        assert_eq!(read_all(&storage, &a.path).await, b"first");
        assert_eq!(read_all(&storage, &b.path).await, b"second");

        // No temp files are left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("x"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn memory_backend_behaves_like_local() {
        let storage = MemoryBlobStorage::new();
        let mut data: &[u8] = b"abc";
        let stored = storage.save("m/file.txt", &mut data).await.unwrap();
        let mut again: &[u8] = b"def";
        let other = storage.save("m/file.txt", &mut again).await.unwrap();
        assert_ne!(stored.path, other.path);
        assert_eq!(storage.paths().len(), 2);
        assert_eq!(read_all(&storage, "m/file.txt").await, b"abc");
        assert_eq!(storage.size("m/file.txt").await.unwrap(), 3);
        assert!(storage.delete_if_exists("m/file.txt").await.unwrap());
        assert!(!storage.delete_if_exists("m/file.txt").await.unwrap());
        assert!(matches!(
            storage.open("m/file.txt").await,
            Err(BlobError::NotFound(_))
        ));
    }
}
