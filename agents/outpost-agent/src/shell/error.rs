//! Shell errors

use thiserror::Error;

/// Why a command produced no result.
///
/// A timeout is not an error: it comes back as a result with `timed_out`
/// set so the caller still sees the partial output.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("command blocked by pattern `{pattern}`")]
    Blocked { pattern: String },

    #[error("failed to start shell: {0}")]
    Spawn(String),

    #[error("invalid command request: {0}")]
    InvalidRequest(String),

    #[error("shell I/O failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("shell session out of sync: {0}")]
    Desync(String),
}

impl ShellError {
    /// Stable code carried in `command_error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            ShellError::Blocked { .. } => "COMMAND_BLOCKED",
            ShellError::Spawn(_) => "SPAWN_FAILED",
            ShellError::InvalidRequest(_) => "INVALID_REQUEST",
            ShellError::Io(_) | ShellError::Desync(_) => "EXECUTION_FAILED",
        }
    }
}
