//! Session Client
//!
//! Dials the server, authenticates, then serves requests on the connection
//! until it fails, and reconnects after the configured delay for as long as
//! the agent runs.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use outpost_protocol::payloads::{AuthPayload, PingPayload};
use outpost_protocol::{
    CorrelationError, Correlator, Envelope, MessageType, Payload, ProtocolError, Slot, Transport,
    TransportError, WebSocketTransport,
};

use crate::agent::dispatch::{Dispatcher, RequestHandler};
use crate::agent::state::AgentStateManager;
use crate::agent::status::StatusCollector;
use crate::cli::config::ServerConfig;

/// Why one connection ended.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("server rejected credentials ({code}): {message}")]
    AuthRejected { code: String, message: String },

    #[error("no auth reply within {0:?}")]
    AuthTimeout(Duration),

    #[error("server stopped answering pings")]
    LivenessLost,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Long-running agent side of the session protocol.
pub struct SessionClient {
    agent_id: String,
    name: String,
    server: ServerConfig,
    handler: Arc<RequestHandler>,
    status: Arc<StatusCollector>,
    state: AgentStateManager,
    shutdown: watch::Receiver<bool>,
}

impl SessionClient {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        server: ServerConfig,
        handler: Arc<RequestHandler>,
        state: AgentStateManager,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            server,
            handler,
            status: Arc::new(StatusCollector::new()),
            state,
            shutdown,
        }
    }

    /// Connect and serve until shutdown.
    ///
    /// Returns an error only for a rejected credential with
    /// `exit_on_auth_failure` set; every other failure is retried.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.connect_and_serve().await {
                Ok(()) => {
                    info!("Connection closed");
                    self.server.reconnect_interval()
                }
                Err(ClientError::AuthRejected { code, message }) => {
                    error!(code = %code, message = %message, "Authentication rejected");
                    if self.server.exit_on_auth_failure {
                        self.state.set_shutting_down();
                        return Err(ClientError::AuthRejected { code, message });
                    }
                    Duration::from_millis(self.server.auth_retry_interval_ms)
                }
                Err(e) => {
                    warn!(error = %e, "Connection failed");
                    self.server.reconnect_interval()
                }
            };

            if *shutdown.borrow() {
                break;
            }
            self.state.set_reconnecting(Some(format!("retrying in {delay:?}")));
            info!(delay_ms = delay.as_millis() as u64, "Waiting before reconnection attempt");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state.set_shutting_down();
        self.handler.shell().shutdown().await;
        Ok(())
    }

    async fn connect_and_serve(&self) -> Result<(), ClientError> {
        self.state.set_connecting();
        info!(url = %self.server.url, "Connecting to server");

        let connect_timeout = Duration::from_secs(self.server.connect_timeout_secs.max(1));
        let transport = timeout(connect_timeout, WebSocketTransport::connect(&self.server.url))
            .await
            .map_err(|_| ClientError::Connect(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        self.serve(transport).await
    }

    /// Authenticate and run the session loop on an open transport.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<(), ClientError> {
        let result = self.serve_inner(&mut transport).await;
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Error closing transport");
        }
        if let Err(e) = &result {
            self.state.set_disconnected(Some(e.to_string()));
        }
        result
    }

    async fn serve_inner<T: Transport>(&self, transport: &mut T) -> Result<(), ClientError> {
        let agent_id = self.authenticate(transport).await?;
        self.handler.begin_session().await;
        self.state.set_connected();
        info!(agent_id = %agent_id, "Session established");

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Envelope>(100);
        let dispatcher = Dispatcher::new(self.handler.clone(), outgoing_tx);
        let pings = Correlator::new();
        let mut pending_ping: Option<Slot> = None;
        let mut shutdown = self.shutdown.clone();

        let heartbeat_every = self.server.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately, so the server sees a status right away.
        let mut status = interval(self.server.status_interval());
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, closing connection");
                        break Ok(());
                    }
                }

                received = transport.receive() => {
                    match received {
                        Ok(envelope) => self.route(envelope, &dispatcher, &pings),
                        Err(e) if !e.is_fatal() => {
                            warn!(error = %e, "Dropping malformed message");
                        }
                        Err(TransportError::Closed) => {
                            info!("Server closed the connection");
                            break Ok(());
                        }
                        Err(e) => break Err(e.into()),
                    }
                }

                Some(envelope) = outgoing_rx.recv() => {
                    let envelope = envelope.with_agent_id(agent_id.clone());
                    debug!(message_type = %envelope.kind, request_id = %envelope.id, "Sending reply");
                    if let Err(e) = transport.send(&envelope).await {
                        break Err(e.into());
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(mut slot) = pending_ping.take() {
                        match slot.try_take() {
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break Err(e.into()),
                            None => break Err(ClientError::LivenessLost),
                        }
                    }

                    let ping = Envelope::request(Payload::Ping(PingPayload {
                        uptime_secs: self.status.uptime_secs(),
                    }))?
                    .with_agent_id(agent_id.clone());
                    pending_ping = Some(pings.register(&ping.id)?);
                    debug!(request_id = %ping.id, "Sending ping");
                    if let Err(e) = transport.send(&ping).await {
                        break Err(e.into());
                    }
                }

                _ = status.tick() => {
                    let report = self.status.report(self.handler.shell().as_ref());
                    let envelope = Envelope::new(Payload::Status(report))?
                        .with_agent_id(agent_id.clone());
                    if let Err(e) = transport.send(&envelope).await {
                        break Err(e.into());
                    }
                }
            }
        };

        pings.fail_all(CorrelationError::Disconnected);
        outcome
    }

    /// Send credentials and wait for the verdict. Returns the agent id the
    /// server assigned.
    async fn authenticate<T: Transport>(&self, transport: &mut T) -> Result<String, ClientError> {
        self.state.set_authenticating();

        let mut auth = AuthPayload::new(self.server.token.clone());
        auth.agent_id = Some(self.agent_id.clone());
        auth.name = Some(self.name.clone());
        auth.hostname = Some(self.status.hostname().to_string());
        auth.version = Some(self.status.version().to_string());

        let request = Envelope::request(Payload::Auth(auth))?.with_agent_id(self.agent_id.clone());
        transport.send(&request).await?;

        let auth_timeout = Duration::from_secs(self.server.auth_timeout_secs.max(1));
        let deadline = Instant::now() + auth_timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, transport.receive()).await {
                Err(_) => return Err(ClientError::AuthTimeout(auth_timeout)),
                Ok(Err(e)) if !e.is_fatal() => {
                    warn!(error = %e, "Dropping malformed message during auth");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(envelope)) => envelope,
            };

            match envelope.payload() {
                Ok(Payload::AuthSuccess(success)) => {
                    let assigned = if success.agent_id.is_empty() {
                        self.agent_id.clone()
                    } else {
                        success.agent_id
                    };
                    debug!(session_id = %success.session_id, "Auth accepted");
                    return Ok(assigned);
                }
                Ok(Payload::AuthError(err)) => {
                    return Err(ClientError::AuthRejected {
                        code: err.code,
                        message: err.message,
                    })
                }
                Ok(_) => {
                    warn!(message_type = %envelope.kind, "Unexpected message before auth reply");
                }
                Err(e) => {
                    warn!(error = %e, "Undecodable message during auth");
                }
            }
        }
    }

    fn route(&self, envelope: Envelope, dispatcher: &Dispatcher, pings: &Arc<Correlator>) {
        match envelope.kind {
            MessageType::Pong => {
                pings.resolve(envelope);
            }
            MessageType::Error => {
                if envelope.is_unsolicited() {
                    warn!(data = %envelope.data, "Server reported an error");
                } else {
                    pings.resolve(envelope);
                }
            }
            kind if kind.is_request() => {
                debug!(message_type = %kind, request_id = %envelope.id, "Dispatching request");
                dispatcher.dispatch(envelope);
            }
            kind => {
                debug!(message_type = %kind, "Ignoring message");
            }
        }
    }
}
