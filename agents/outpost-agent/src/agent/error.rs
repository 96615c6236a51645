//! Handler errors

use std::io;
use thiserror::Error;

/// Failure of a file, service or log request.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Stable code carried in the error reply.
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::InvalidRequest(_) => "INVALID_REQUEST",
            HandlerError::NotFound(_) => "NOT_FOUND",
            HandlerError::AccessDenied(_) => "ACCESS_DENIED",
            HandlerError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            HandlerError::CommandFailed { .. } => "COMMAND_FAILED",
            HandlerError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => "NOT_FOUND",
                io::ErrorKind::PermissionDenied => "ACCESS_DENIED",
                io::ErrorKind::AlreadyExists => "ALREADY_EXISTS",
                _ => "IO_ERROR",
            },
        }
    }
}
