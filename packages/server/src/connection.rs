//! Agent connection handling
//!
//! Runs one authenticated agent connection: the auth handshake, then a loop
//! that writes queued requests out and routes everything the agent sends
//! back. When the loop ends, for whatever reason, the agent is unregistered
//! and its waiters are woken.

use chrono::Utc;
use outpost_protocol::payloads::{AuthPayload, AuthSuccessPayload, ErrorPayload, PongPayload};
use outpost_protocol::{Envelope, MessageType, Payload, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::hub::{AgentChannels, AgentDetails, AgentHandle, Hub};

/// Why a connection was refused during the handshake.
struct Rejection {
    request_id: String,
    code: &'static str,
    message: String,
}

impl Rejection {
    fn new(request_id: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            code,
            message: message.into(),
        }
    }
}

/// Serve one agent connection until it closes or the hub drops it.
pub async fn serve_connection<T: Transport>(hub: Hub, auth: Arc<Authenticator>, mut transport: T) {
    let peer = transport.peer_addr();
    let auth_timeout = hub.config().auth_timeout();

    let (agent, channels) = match handshake(&hub, &auth, &mut transport, auth_timeout).await {
        Ok(registered) => registered,
        Err(Some(rejection)) => {
            warn!(
                peer = ?peer,
                code = rejection.code,
                reason = %rejection.message,
                "Rejecting agent connection"
            );
            let payload = Payload::AuthError(ErrorPayload::new(rejection.code, rejection.message));
            if let Ok(envelope) = Envelope::new(payload) {
                let _ = transport.send(&envelope.with_id(rejection.request_id)).await;
            }
            let _ = transport.close().await;
            return;
        }
        Err(None) => {
            debug!(peer = ?peer, "Connection closed before authenticating");
            let _ = transport.close().await;
            return;
        }
    };

    let agent_id = agent.id().to_string();
    match run(&agent, channels, &mut transport).await {
        Ok(()) => info!(agent_id = %agent_id, "Agent connection closed"),
        Err(e) => warn!(agent_id = %agent_id, error = %e, "Agent connection failed"),
    }

    agent.close();
    hub.unregister(&agent_id, agent.connection_id()).await;
    if let Err(e) = transport.close().await {
        debug!(agent_id = %agent_id, error = %e, "Error closing transport");
    }
}

/// Wait for the auth request, verify it and register the agent.
///
/// `Err(None)` means the peer went away without saying anything useful.
async fn handshake<T: Transport>(
    hub: &Hub,
    auth: &Authenticator,
    transport: &mut T,
    auth_timeout: Duration,
) -> Result<(Arc<AgentHandle>, AgentChannels), Option<Rejection>> {
    let envelope = match timeout(auth_timeout, transport.receive()).await {
        Err(_) => {
            return Err(Some(Rejection::new(
                "",
                "AUTH_TIMEOUT",
                format!("no auth request within {auth_timeout:?}"),
            )))
        }
        Ok(Err(TransportError::Protocol(e))) => {
            return Err(Some(Rejection::new("", "INVALID_REQUEST", e.to_string())))
        }
        Ok(Err(_)) => return Err(None),
        Ok(Ok(envelope)) => envelope,
    };

    let request: AuthPayload = match envelope.expect(MessageType::Auth) {
        Ok(Payload::Auth(request)) => request,
        Ok(_) | Err(_) => {
            return Err(Some(Rejection::new(
                envelope.id,
                "AUTH_REQUIRED",
                format!("expected `auth`, got `{}`", envelope.kind),
            )))
        }
    };

    let identity = auth
        .verify(&request.token, request.agent_id.as_deref())
        .map_err(|e| Some(Rejection::new(envelope.id.clone(), e.code(), e.to_string())))?;

    let (agent, channels) = AgentHandle::new(
        AgentDetails {
            id: identity.agent_id,
            name: request.name,
            hostname: request.hostname,
            version: request.version,
            peer: transport.peer_addr(),
        },
        hub.config().outbound_queue,
    );

    hub.register(agent.clone())
        .await
        .map_err(|e| Some(Rejection::new(envelope.id.clone(), "SHUTTING_DOWN", e.to_string())))?;

    let success = envelope
        .reply(Payload::AuthSuccess(AuthSuccessPayload {
            agent_id: agent.id().to_string(),
            session_id: agent.connection_id().to_string(),
            server_time: Some(Utc::now()),
        }))
        .map(|reply| reply.with_agent_id(agent.id().to_string()));

    let sent = match success {
        Ok(reply) => transport.send(&reply).await.is_ok(),
        Err(_) => false,
    };
    if !sent {
        hub.unregister(agent.id(), agent.connection_id()).await;
        return Err(None);
    }

    info!(
        agent_id = %agent.id(),
        method = ?identity.method,
        peer = ?agent.details().peer,
        "Agent authenticated"
    );
    Ok((agent, channels))
}

async fn run<T: Transport>(
    agent: &AgentHandle,
    mut channels: AgentChannels,
    transport: &mut T,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            changed = channels.closed.changed() => {
                if changed.is_err() || *channels.closed.borrow() {
                    debug!(agent_id = %agent.id(), "Hub dropped connection");
                    return Ok(());
                }
            }

            Some(envelope) = channels.outbound.recv() => {
                transport.send(&envelope).await?;
            }

            received = transport.receive() => {
                match received {
                    Ok(envelope) => route(agent, transport, envelope).await?,
                    Err(e) if !e.is_fatal() => {
                        warn!(agent_id = %agent.id(), error = %e, "Dropping malformed message");
                    }
                    Err(TransportError::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

async fn route<T: Transport>(
    agent: &AgentHandle,
    transport: &mut T,
    envelope: Envelope,
) -> Result<(), TransportError> {
    agent.touch();

    match envelope.kind {
        MessageType::Ping => {
            let pong = envelope.reply(Payload::Pong(PongPayload {
                server_time: Some(Utc::now()),
            }))?;
            transport.send(&pong).await?;
        }
        MessageType::Status => match envelope.payload() {
            Ok(Payload::Status(report)) => agent.set_status(report),
            Ok(_) => {}
            Err(e) => warn!(agent_id = %agent.id(), error = %e, "Undecodable status report"),
        },
        MessageType::Auth => {
            warn!(agent_id = %agent.id(), "Ignoring auth on an authenticated connection");
        }
        kind if envelope.is_unsolicited() => {
            debug!(agent_id = %agent.id(), message_type = %kind, "Ignoring unsolicited message");
        }
        _ => {
            agent.correlator().resolve(envelope);
        }
    }
    Ok(())
}
