//! Zip expansion for sessions that unpack archives into individual uploads.
//!
//! Entries are extracted to a scratch directory next to the staging area and then
//! fed one by one through the normal upload pipeline by the engine.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{0} is empty.")]
    Empty(String),
    #[error("{name} is not a readable zip archive: {reason}")]
    Unreadable { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One non-directory entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
    /// Extracted to `path`.
    File { name: String, path: PathBuf, size: u64 },
    /// A zip inside the zip. Never extracted.
    Nested { name: String },
    /// Declared size is above the limit. Never extracted.
    TooLarge { name: String, size: u64 },
}

impl ArchiveEntry {
    pub fn name(&self) -> &str {
        match self {
            ArchiveEntry::File { name, .. }
            | ArchiveEntry::Nested { name }
            | ArchiveEntry::TooLarge { name, .. } => name,
        }
    }
}

/// Extracted archive contents, in archive order. Call [`Extraction::cleanup`]
/// once the entries have been consumed.
#[derive(Debug)]
pub struct Extraction {
    pub dir: PathBuf,
    pub entries: Vec<ArchiveEntry>,
}

impl Extraction {
    pub async fn cleanup(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to remove extraction dir {}: {}", self.dir.display(), err);
            }
        }
    }
}

pub fn is_archive(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Base name of an archive member, so `docs/../a.pdf` becomes `a.pdf`.
fn entry_base_name(raw: &str, index: usize) -> String {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("entry-{}", index))
}

/// Expand `archive` (shown to users as `archive_name`) under `scratch_root`.
///
/// Entries whose declared size exceeds `max_entry_size` and nested zips are
/// listed but not written. An archive with no file entries is an error and
/// leaves nothing behind.
pub async fn extract(
    archive: &Path,
    archive_name: &str,
    scratch_root: &Path,
    max_entry_size: Option<u64>,
) -> Result<Extraction, ArchiveError> {
    let archive = archive.to_path_buf();
    let archive_name = archive_name.to_string();
    let dir = scratch_root.join(format!(".expand-{}", Uuid::new_v4().simple()));

    let task_dir = dir.clone();
    let result = tokio::task::spawn_blocking(move || {
        extract_blocking(&archive, &archive_name, &task_dir, max_entry_size)
    })
    .await
    .map_err(|e| ArchiveError::Io(io::Error::other(e)))?;

    match result {
        Ok(entries) => Ok(Extraction { dir, entries }),
        Err(err) => {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            Err(err)
        }
    }
}

fn extract_blocking(
    archive: &Path,
    archive_name: &str,
    dir: &Path,
    max_entry_size: Option<u64>,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let unreadable = |e: zip::result::ZipError| ArchiveError::Unreadable {
        name: archive_name.to_string(),
        reason: e.to_string(),
    };

    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(unreadable)?;
    let mut entries = Vec::new();

    for index in 0..zip.len() {
        let mut member = zip.by_index(index).map_err(unreadable)?;
        if member.is_dir() {
            continue;
        }
        let name = entry_base_name(member.name(), index);

        if is_archive(&name) {
            entries.push(ArchiveEntry::Nested { name });
            continue;
        }
        if let Some(max) = max_entry_size {
            if member.size() > max {
                entries.push(ArchiveEntry::TooLarge {
                    name,
                    size: member.size(),
                });
                continue;
            }
        }

        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("entry-{}", index));
        let mut out = File::create(&path)?;
        let size = io::copy(&mut member, &mut out)?;
        entries.push(ArchiveEntry::File { name, path, size });
    }

    if entries.is_empty() {
        return Err(ArchiveError::Empty(archive_name.to_string()));
    }
    tracing::debug!(archive = %archive_name, entries = entries.len(), "archive expanded");
    Ok(entries)
}
