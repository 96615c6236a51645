//! File Handler
//!
//! Chunked uploads plus list/delete/mkdir. Chunks land in a `.outpost-part`
//! file at their own offset, so they may arrive in any order; the file is
//! moved into place once the last chunk is in and no byte range is missing.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use outpost_protocol::payloads::{
    FileChunk, FileChunkResult, FileDeleteRequest, FileEntry, FileListRequest, FileListResult,
    FileMkdirRequest, FilePathResult,
};

use super::error::HandlerError;

const PART_SUFFIX: &str = ".outpost-part";

/// Default for how long an upload may go without a chunk before it is
/// treated as abandoned.
pub const UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Byte ranges received so far for one destination.
#[derive(Debug)]
struct Upload {
    /// offset -> length
    ranges: BTreeMap<u64, u64>,
    /// Known once the `is_last` chunk has been applied.
    total: Option<u64>,
    last_chunk: Instant,
}

impl Upload {
    fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
            total: None,
            last_chunk: Instant::now(),
        }
    }

    /// Whether a chunk cannot belong to the upload tracked so far: it ends
    /// somewhere else than the known end, or runs past it.
    fn conflicts(&self, offset: u64, len: u64, is_last: bool) -> bool {
        match self.total {
            Some(total) if is_last => offset + len != total,
            Some(total) => offset + len > total,
            None => false,
        }
    }

    fn record(&mut self, offset: u64, len: u64, is_last: bool) {
        let slot = self.ranges.entry(offset).or_insert(0);
        *slot = (*slot).max(len);
        if is_last {
            self.total = Some(offset + len);
        }
    }

    fn received(&self) -> u64 {
        self.ranges.values().sum()
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        let mut covered = 0u64;
        for (&offset, &len) in &self.ranges {
            if offset > covered {
                return false;
            }
            covered = covered.max(offset + len);
        }
        covered >= total
    }
}

/// Handles the `file_*` requests.
pub struct FileHandler {
    root: Option<PathBuf>,
    uploads: DashMap<PathBuf, Upload>,
    idle_timeout: Duration,
}

impl FileHandler {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            uploads: DashMap::new(),
            idle_timeout: UPLOAD_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Forget every unfinished upload and remove its part file. Called when
    /// a new session starts, since the server has no memory of the old one.
    pub async fn discard_uploads(&self) {
        let targets: Vec<PathBuf> = self.uploads.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            if self.uploads.remove(&target).is_none() {
                continue;
            }
            let part = part_path(&target);
            match fs::remove_file(&part).await {
                Ok(()) => info!(path = %target.display(), "Discarded unfinished upload"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %part.display(), error = %e, "Failed to remove part file"),
            }
        }
    }

    /// Number of uploads with chunks outstanding.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Apply one chunk of an upload.
    pub async fn write_chunk(&self, chunk: FileChunk) -> Result<FileChunkResult, HandlerError> {
        let target = self.resolve(&chunk.path)?;
        let len = chunk.data.len() as u64;

        if !chunk.checksum.is_empty() {
            let actual = hex::encode(Sha256::digest(&chunk.data));
            if !actual.eq_ignore_ascii_case(&chunk.checksum) {
                return Err(HandlerError::ChecksumMismatch {
                    expected: chunk.checksum,
                    actual,
                });
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // A chunk that starts tracking, or replaces a stale or conflicting
        // upload, starts from an empty part file.
        let fresh = match self.uploads.entry(target.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Upload::new());
                true
            }
            Entry::Occupied(mut entry) => {
                let upload = entry.get();
                if upload.last_chunk.elapsed() >= self.idle_timeout
                    || upload.conflicts(chunk.offset, len, chunk.is_last)
                {
                    debug!(path = %target.display(), "Restarting upload");
                    entry.insert(Upload::new());
                    true
                } else {
                    false
                }
            }
        };

        let part = part_path(&target);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(fresh)
            .open(&part)
            .await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.write_all(&chunk.data).await?;
        file.flush().await?;
        drop(file);

        let received = {
            let mut upload = self.uploads.entry(target.clone()).or_insert_with(Upload::new);
            upload.record(chunk.offset, len, chunk.is_last);
            upload.last_chunk = Instant::now();
            upload.received()
        };
        debug!(
            path = %target.display(),
            offset = chunk.offset,
            bytes = len,
            received,
            "File chunk written"
        );

        let mut result = FileChunkResult {
            path: chunk.path,
            offset: chunk.offset,
            bytes_written: len,
            complete: false,
            checksum: None,
            size: None,
        };

        // Only one writer wins the removal, so the rename happens once.
        let Some((_, upload)) = self.uploads.remove_if(&target, |_, u| u.is_complete()) else {
            return Ok(result);
        };
        let size = upload.total.unwrap_or(0);

        let file = fs::OpenOptions::new().write(true).open(&part).await?;
        file.set_len(size).await?;
        drop(file);
        fs::rename(&part, &target).await?;

        let checksum = sha256_file(&target).await?;
        info!(path = %target.display(), size, checksum = %checksum, "Upload complete");

        result.complete = true;
        result.checksum = Some(checksum);
        result.size = Some(size);
        Ok(result)
    }

    /// List a directory.
    pub async fn list(&self, request: FileListRequest) -> Result<FileListResult, HandlerError> {
        let dir = self.resolve(&request.path)?;
        let mut reader = fs::read_dir(&dir).await.map_err(|e| not_found(e, &request.path))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                mode: file_mode(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(FileListResult {
            path: dir.to_string_lossy().into_owned(),
            entries,
        })
    }

    /// Delete a file or directory.
    pub async fn delete(&self, request: FileDeleteRequest) -> Result<FilePathResult, HandlerError> {
        let target = self.resolve(&request.path)?;
        if self.root.as_deref() == Some(target.as_path()) {
            return Err(HandlerError::AccessDenied("refusing to delete the file root".into()));
        }

        let metadata = fs::symlink_metadata(&target)
            .await
            .map_err(|e| not_found(e, &request.path))?;
        if metadata.is_dir() {
            if request.recursive {
                fs::remove_dir_all(&target).await?;
            } else {
                fs::remove_dir(&target).await?;
            }
        } else {
            fs::remove_file(&target).await?;
        }

        info!(path = %target.display(), recursive = request.recursive, "Deleted");
        Ok(FilePathResult {
            path: target.to_string_lossy().into_owned(),
        })
    }

    /// Create a directory.
    pub async fn mkdir(&self, request: FileMkdirRequest) -> Result<FilePathResult, HandlerError> {
        let target = self.resolve(&request.path)?;
        if request.parents {
            fs::create_dir_all(&target).await?;
        } else {
            fs::create_dir(&target).await?;
        }
        Ok(FilePathResult {
            path: target.to_string_lossy().into_owned(),
        })
    }

    /// Map a requested path onto the filesystem, honouring the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, HandlerError> {
        let requested = checked_path(path)?;
        match &self.root {
            Some(root) if requested.is_absolute() => {
                if requested.starts_with(root) {
                    Ok(requested)
                } else {
                    Err(HandlerError::AccessDenied(format!(
                        "{path} is outside {}",
                        root.display()
                    )))
                }
            }
            Some(root) => Ok(root.join(requested)),
            None if requested.is_absolute() => Ok(requested),
            None => Err(HandlerError::InvalidRequest(format!(
                "path must be absolute: {path}"
            ))),
        }
    }
}

/// Parse a request path, rejecting empty paths and `..` components.
pub(crate) fn checked_path(path: &str) -> Result<PathBuf, HandlerError> {
    if path.is_empty() {
        return Err(HandlerError::InvalidRequest("empty path".into()));
    }
    let path = PathBuf::from(path);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(HandlerError::AccessDenied(format!(
            "parent directory components are not allowed: {}",
            path.display()
        )));
    }
    Ok(path)
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn not_found(error: std::io::Error, path: &str) -> HandlerError {
    if error.kind() == std::io::ErrorKind::NotFound {
        HandlerError::NotFound(path.to_string())
    } else {
        HandlerError::Io(error)
    }
}

async fn sha256_file(path: &Path) -> Result<String, HandlerError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}
