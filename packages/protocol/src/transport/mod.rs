//! Transport Connection
//!
//! Abstraction over an ordered, message-framed duplex stream. Each frame is
//! one serialized [`Envelope`]; this layer imposes no size limit.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::envelope::Envelope;
use crate::error::{ProtocolError, TransportError};

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

/// A bidirectional envelope stream.
///
/// `receive` must be cancel-safe: connection loops poll it inside
/// `tokio::select!` next to outbound traffic and timers.
#[async_trait]
pub trait Transport: Send {
    /// Send one envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Wait for the next envelope.
    ///
    /// A frame that fails to decode yields [`TransportError::Protocol`]; the
    /// connection stays usable.
    async fn receive(&mut self) -> Result<Envelope, TransportError>;

    /// Close the connection. Further sends fail with `Closed`.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Decode one text frame into an envelope.
pub fn decode_frame(frame: &str) -> Result<Envelope, TransportError> {
    Envelope::from_json(frame).map_err(TransportError::from)
}

/// Decode one binary frame; it must carry the same UTF-8 JSON as a text frame.
pub fn decode_binary_frame(frame: Vec<u8>) -> Result<Envelope, TransportError> {
    let text = String::from_utf8(frame).map_err(ProtocolError::NonUtf8)?;
    decode_frame(&text)
}
