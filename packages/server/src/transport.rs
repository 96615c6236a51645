//! Server-side WebSocket transport
//!
//! [`Transport`] over an upgraded axum socket, so connection handling is the
//! same code whether the agent arrives over the network or an in-memory
//! pair in tests.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use outpost_protocol::transport::{decode_binary_frame, decode_frame};
use outpost_protocol::{Envelope, Transport, TransportError};
use std::net::SocketAddr;
use tracing::debug;

pub struct AxumTransport {
    socket: WebSocket,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl AxumTransport {
    pub fn new(socket: WebSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let json = envelope.to_json()?;
        self.socket
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Envelope, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return decode_frame(&text),
                Some(Ok(Message::Binary(data))) => return decode_binary_frame(data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Agent sent close frame");
                    self.closed = true;
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => {
                    self.closed = true;
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
