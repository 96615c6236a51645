//! WebSocket Transport
//!
//! [`Transport`] over a `tokio-tungstenite` stream. Used by the agent to dial
//! the server, and by tests to talk to a running server.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{decode_binary_frame, decode_frame, Transport};
use crate::envelope::Envelope;
use crate::error::TransportError;

/// Envelope transport over a WebSocket.
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Dial a `ws://` or `wss://` endpoint.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let peer = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };

        Ok(Self::new(stream, peer))
    }
}

impl<S> WebSocketTransport<S> {
    /// Wrap an already-established stream.
    pub fn new(stream: WebSocketStream<S>, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let json = envelope.to_json()?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Envelope, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return decode_frame(&text),
                Some(Ok(Message::Binary(data))) => return decode_binary_frame(data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // tungstenite queues the pong itself
                    debug!("WebSocket control frame");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
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
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
