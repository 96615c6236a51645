//! Protocol Errors
//!
//! Error types shared by both ends of an Outpost connection.

use thiserror::Error;

use crate::envelope::MessageType;

/// A single message could not be understood.
///
/// Protocol errors are local to one frame: the receiver logs and drops the
/// frame and keeps the connection open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("payload does not match message type `{kind}`: {source}")]
    InvalidPayload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame is not valid UTF-8: {0}")]
    NonUtf8(#[source] std::string::FromUtf8Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("expected `{expected}` message, got `{actual}`")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// Failure of the underlying duplex stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// A protocol error only poisons the frame it arrived in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

/// Outcome of waiting on a correlation slot that did not yield a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("peer disconnected before replying")]
    Disconnected,

    #[error("no reply arrived before the deadline")]
    Timeout,

    #[error("request id `{0}` is already outstanding")]
    DuplicateId(String),
}
