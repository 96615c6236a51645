//! In-memory Transport
//!
//! A connected pair of transports backed by channels. Frames still pass
//! through JSON so decode failures behave as they do on a socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use super::{decode_frame, Transport};
use crate::envelope::Envelope;
use crate::error::TransportError;

/// One end of an in-memory connection.
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
    peer: Option<SocketAddr>,
}

/// Create two connected ends.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: a_rx,
            peer: None,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: b_rx,
            peer: None,
        },
    )
}

impl MemoryTransport {
    /// Report `addr` as this end's peer, as a socket would.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// Push a raw frame, bypassing envelope encoding.
    pub fn send_raw(&mut self, frame: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame.into()).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let json = envelope.to_json()?;
        self.send_raw(json)
    }

    async fn receive(&mut self) -> Result<Envelope, TransportError> {
        match self.rx.recv().await {
            Some(frame) => decode_frame(&frame),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping our sender ends the peer's stream.
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{MessageType, Payload};
    use crate::payloads::PingPayload;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = pair();
        for uptime in 0..3 {
            let env = Envelope::new(Payload::Ping(PingPayload { uptime_secs: uptime })).unwrap();
            a.send(&env).await.unwrap();
        }
        for uptime in 0..3 {
            let env = b.receive().await.unwrap();
            assert_eq!(env.kind, MessageType::Ping);
            assert_eq!(env.data["uptime_secs"], uptime);
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (mut a, mut b) = pair();
        a.send_raw("{not json").unwrap();
        a.send(&Envelope::new(Payload::Ping(PingPayload::default())).unwrap())
            .await
            .unwrap();

        let err = b.receive().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(b.receive().await.unwrap().kind, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (mut a, mut b) = pair();
        a.close().await.unwrap();
        assert!(matches!(b.receive().await, Err(TransportError::Closed)));
        assert!(matches!(
            a.send(&Envelope::new(Payload::Ping(PingPayload::default())).unwrap()).await,
            Err(TransportError::Closed)
        ));
    }
}
