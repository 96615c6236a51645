//! Connected agent handle
//!
//! One per authenticated connection. The connection task owns the transport;
//! everyone else reaches the agent through the handle's outbound queue and
//! correlator.

use chrono::{DateTime, TimeZone, Utc};
use outpost_protocol::payloads::StatusReport;
use outpost_protocol::{new_request_id, CorrelationError, Correlator, Envelope};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::HubError;

/// What an agent told us about itself at auth time.
#[derive(Debug, Clone, Default)]
pub struct AgentDetails {
    pub id: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub peer: Option<SocketAddr>,
}

/// Receiving ends held by the connection task.
pub struct AgentChannels {
    /// Envelopes to write to the agent
    pub outbound: mpsc::Receiver<Envelope>,
    /// Flips to `true` when the hub drops this connection
    pub closed: watch::Receiver<bool>,
}

/// Serializable snapshot for listings.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub connection_id: Uuid,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pending_requests: usize,
    pub status: Option<StatusReport>,
}

pub struct AgentHandle {
    details: AgentDetails,
    connection_id: Uuid,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    outbound: mpsc::Sender<Envelope>,
    correlator: Arc<Correlator>,
    status: RwLock<Option<StatusReport>>,
    closed: watch::Sender<bool>,
}

impl AgentHandle {
    pub fn new(details: AgentDetails, queue: usize) -> (Arc<Self>, AgentChannels) {
        let (outbound, outbound_rx) = mpsc::channel(queue.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let now = Utc::now();

        let handle = Arc::new(Self {
            details,
            connection_id: Uuid::new_v4(),
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            outbound,
            correlator: Correlator::new(),
            status: RwLock::new(None),
            closed,
        });

        (
            handle,
            AgentChannels {
                outbound: outbound_rx,
                closed: closed_rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.details.id
    }

    /// Distinguishes this connection from earlier ones under the same id.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn details(&self) -> &AgentDetails {
        &self.details
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Queue without waiting; fails when the queue is full or closed.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), HubError> {
        self.outbound
            .try_send(envelope.with_agent_id(self.details.id.clone()))
            .map_err(|_| HubError::Disconnected(self.details.id.clone()))
    }

    /// Send `envelope` and wait for the reply carrying its id.
    ///
    /// An empty id is replaced with a fresh one. The reply slot is released
    /// on every exit path, so a reply arriving after the deadline is
    /// dropped by the correlator.
    pub async fn request(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, HubError> {
        if envelope.id.is_empty() {
            envelope.id = new_request_id();
        }
        let request_id = envelope.id.clone();

        let slot = self
            .correlator
            .register(&request_id)
            .map_err(|e| HubError::from_correlation(e, self.id(), timeout))?;

        debug!(
            agent_id = %self.details.id,
            request_id = %request_id,
            message_type = %envelope.kind,
            "Sending request"
        );
        // One deadline covers both the queue and the reply.
        let deadline = Instant::now() + timeout;
        self.outbound
            .send_timeout(envelope.with_agent_id(self.details.id.clone()), timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    HubError::from_correlation(CorrelationError::Timeout, self.id(), timeout)
                }
                SendTimeoutError::Closed(_) => HubError::Disconnected(self.details.id.clone()),
            })?;

        slot.wait(deadline.saturating_duration_since(Instant::now()))
            .await
            .map_err(|e| HubError::from_correlation(e, self.id(), timeout))
    }

    /// Record proof of life.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        let ms = self.last_seen_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.connected_at)
    }

    /// Time since the agent was last heard from.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(ms.max(0) as u64)
    }

    pub fn set_status(&self, report: StatusReport) {
        *self.status.write() = Some(report);
    }

    pub fn status(&self) -> Option<StatusReport> {
        self.status.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail every waiter with `Disconnected` and tell the connection task to
    /// stop.
    pub fn close(&self) {
        self.correlator.fail_all(CorrelationError::Disconnected);
        self.closed.send_replace(true);
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.details.id.clone(),
            connection_id: self.connection_id,
            name: self.details.name.clone(),
            hostname: self.details.hostname.clone(),
            version: self.details.version.clone(),
            peer: self.details.peer.map(|p| p.to_string()),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
            pending_requests: self.correlator.pending(),
            status: self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_protocol::payloads::{CommandRequest, CommandResult};
    use outpost_protocol::Payload;

    fn handle() -> (Arc<AgentHandle>, AgentChannels) {
        AgentHandle::new(
            AgentDetails {
                id: "agent-1".to_string(),
                ..Default::default()
            },
            8,
        )
    }

    #[tokio::test]
    async fn test_request_assigns_id_and_resolves() {
        let (agent, mut channels) = handle();

        let envelope = Envelope::new(Payload::CommandExecute(CommandRequest::new("uptime"))).unwrap();
        let requester = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.request(envelope, Duration::from_secs(5)).await })
        };

        let sent = channels.outbound.recv().await.unwrap();
        assert!(!sent.id.is_empty());
        assert_eq!(sent.agent_id, "agent-1");

        let reply = sent
            .reply(Payload::CommandResult(CommandResult {
                stdout: "up".to_string(),
                ..Default::default()
            }))
            .unwrap();
        assert!(agent.correlator().resolve(reply));

        let got = requester.await.unwrap().unwrap();
        assert_eq!(got.id, sent.id);
        assert_eq!(agent.correlator().pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let (agent, _channels) = handle();
        let envelope = Envelope::request(Payload::CommandExecute(CommandRequest::new("x"))).unwrap();

        let err = agent
            .request(envelope, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
        assert_eq!(agent.correlator().pending(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_honours_timeout() {
        let (agent, _channels) = AgentHandle::new(
            AgentDetails {
                id: "stuck".to_string(),
                ..Default::default()
            },
            1,
        );
        let request = || Envelope::request(Payload::CommandExecute(CommandRequest::new("x"))).unwrap();

        // Fills the only queue slot; nothing drains it.
        let first = agent.request(request(), Duration::from_millis(100)).await;
        assert!(matches!(first, Err(HubError::Timeout { .. })));

        let started = Instant::now();
        let second = tokio::time::timeout(
            Duration::from_secs(2),
            agent.request(request(), Duration::from_millis(100)),
        )
        .await
        .expect("request blocked past its timeout");
        assert!(matches!(second, Err(HubError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(agent.correlator().pending(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_signals() {
        let (agent, channels) = handle();
        let envelope = Envelope::request(Payload::CommandExecute(CommandRequest::new("x"))).unwrap();

        let requester = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.request(envelope, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.close();

        let err = tokio::time::timeout(Duration::from_secs(1), requester)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, HubError::Disconnected(_)));
        assert!(*channels.closed.borrow());
        assert!(agent.is_closed());
    }

    #[test]
    fn test_idle_tracking() {
        let (agent, _channels) = handle();
        agent.touch();
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert!(agent.idle_for(later) >= Duration::from_secs(4));
        assert_eq!(agent.info().id, "agent-1");
    }
}
