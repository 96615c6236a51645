//! Log Handler
//!
//! Lists and tails files under the configured log directories.

use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use outpost_protocol::payloads::{
    LogContentRequest, LogContentResult, LogFile, LogListRequest, LogListResult,
};

use super::error::HandlerError;
use super::files::checked_path;

const DEFAULT_LINES: usize = 100;
const TAIL_BLOCK: u64 = 64 * 1024;

/// Handles the `log_*` requests.
pub struct LogHandler {
    directories: Vec<PathBuf>,
    max_lines: usize,
}

impl LogHandler {
    pub fn new(directories: Vec<PathBuf>, max_lines: usize) -> Self {
        Self {
            directories,
            max_lines: max_lines.max(1),
        }
    }

    /// Regular files in one allowed directory, or in all of them.
    pub async fn list(&self, request: LogListRequest) -> Result<LogListResult, HandlerError> {
        let dirs = match request.directory.as_deref() {
            Some(dir) => vec![self.allowed(dir)?],
            None => self.directories.clone(),
        };

        let mut files = Vec::new();
        for dir in dirs {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping log directory");
                    continue;
                }
            };
            while let Some(entry) = reader.next_entry().await? {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                files.push(LogFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(LogListResult { files })
    }

    /// The last lines of a log file.
    pub async fn content(
        &self,
        request: LogContentRequest,
    ) -> Result<LogContentResult, HandlerError> {
        let path = self.allowed(&request.path)?;
        let wanted = request
            .lines
            .unwrap_or(DEFAULT_LINES)
            .clamp(1, self.max_lines);

        let (lines, truncated) = tail(&path, wanted).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HandlerError::NotFound(request.path.clone())
            } else {
                HandlerError::Io(e)
            }
        })?;

        Ok(LogContentResult {
            path: path.to_string_lossy().into_owned(),
            lines: lines.len(),
            content: lines.join("\n"),
            truncated,
        })
    }

    fn allowed(&self, path: &str) -> Result<PathBuf, HandlerError> {
        let path = checked_path(path)?;
        if path.is_absolute() && self.directories.iter().any(|dir| path.starts_with(dir)) {
            Ok(path)
        } else {
            Err(HandlerError::AccessDenied(format!(
                "{} is not inside a log directory",
                path.display()
            )))
        }
    }
}

/// Read backwards in blocks until `wanted` lines are available or the file
/// start is reached. Returns the lines and whether earlier ones were cut.
async fn tail(path: &Path, wanted: usize) -> std::io::Result<(Vec<String>, bool)> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut start = len;
    let mut data: Vec<u8> = Vec::new();
    loop {
        let newlines = data.iter().filter(|&&b| b == b'\n').count();
        if start == 0 || newlines > wanted {
            break;
        }
        let block = TAIL_BLOCK.min(start);
        start -= block;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; block as usize];
        file.read_exact(&mut buf).await?;
        buf.extend_from_slice(&data);
        data = buf;
    }

    let text = String::from_utf8_lossy(&data);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    let mut lines: Vec<&str> = if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').collect()
    };
    // Reading from mid-file leaves a partial first line.
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }

    let truncated = start > 0 || lines.len() > wanted;
    let skip = lines.len().saturating_sub(wanted);
    Ok((
        lines[skip..].iter().map(|l| l.to_string()).collect(),
        truncated,
    ))
}
