//! Outpost Protocol Library
//!
//! Shared by the agent and the server: the wire envelope and its typed
//! payloads, the transport abstraction, and the request/response correlator.

pub mod correlator;
pub mod envelope;
pub mod error;
pub mod payloads;
pub mod transport;

// Re-exports for convenience
pub use correlator::{Correlator, Slot};
pub use envelope::{new_request_id, Envelope, MessageType, Payload};
pub use error::{CorrelationError, ProtocolError, TransportError};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
