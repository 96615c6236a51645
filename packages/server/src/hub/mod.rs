//! Session Registry
//!
//! The agent map is owned by a single task. Register, unregister, lookups,
//! broadcasts and the inactivity sweep all arrive on its command queue and
//! run one at a time, so no two mutations ever interleave.

pub mod agent;

pub use agent::{AgentChannels, AgentDetails, AgentHandle, AgentInfo};

use chrono::Utc;
use outpost_protocol::payloads::{CommandRequest, CommandResult, ErrorPayload};
use outpost_protocol::{Envelope, MessageType, Payload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;

/// Extra time allowed on top of a command's own timeout before the caller
/// gives up waiting for the agent's reply.
pub const COMMAND_REPLY_GRACE: Duration = Duration::from_secs(5);

enum Command {
    Register {
        agent: Arc<AgentHandle>,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        agent_id: String,
        connection_id: Uuid,
    },
    Get {
        agent_id: String,
        reply: oneshot::Sender<Option<Arc<AgentHandle>>>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<AgentHandle>>>,
    },
    Broadcast {
        envelope: Envelope,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Start the registry task on the current runtime.
    pub fn new(config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_queue.max(1));
        let registry = Registry {
            agents: HashMap::new(),
            accepting: true,
            inactivity_timeout: config.inactivity_timeout(),
        };
        tokio::spawn(registry.run(rx, config.sweep_interval()));

        Self {
            commands,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Add an agent. An existing connection under the same id is closed and
    /// its waiters fail with `Disconnected`.
    pub async fn register(&self, agent: Arc<AgentHandle>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Register { agent, reply })
            .await
            .map_err(|_| HubError::Shutdown)?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Remove an agent if `connection_id` is still its current connection,
    /// failing its outstanding requests.
    pub async fn unregister(&self, agent_id: &str, connection_id: Uuid) {
        let command = Command::Unregister {
            agent_id: agent_id.to_string(),
            connection_id,
        };
        if self.commands.send(command).await.is_err() {
            debug!(agent_id = %agent_id, "Registry already stopped");
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Get {
            agent_id: agent_id.to_string(),
            reply,
        };
        self.commands.send(command).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Every registered agent, sorted by id.
    pub async fn agents(&self) -> Vec<Arc<AgentHandle>> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Best-effort fan-out. Returns how many agents accepted the envelope.
    pub async fn broadcast(&self, envelope: Envelope) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Broadcast { envelope, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Send `envelope` to an agent and wait up to `timeout` for the reply
    /// carrying its id.
    pub async fn send_with_response(
        &self,
        agent_id: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, HubError> {
        let agent = self
            .get(agent_id)
            .await
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;
        agent.request(envelope, timeout).await
    }

    /// Typed request. Error replies become [`HubError::Remote`]; any reply
    /// other than the request's own result type is rejected.
    pub async fn request(
        &self,
        agent_id: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, HubError> {
        let kind = payload.kind();
        let (result_kind, _) = kind.response_types().ok_or(HubError::NotRequest(kind))?;
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());

        let reply = self
            .send_with_response(agent_id, Envelope::request(payload)?, timeout)
            .await?;

        if reply.kind.is_error() {
            let error: ErrorPayload = serde_json::from_value(reply.data.clone()).unwrap_or_else(|_| {
                ErrorPayload::new("UNKNOWN_ERROR", format!("undecodable `{}` reply", reply.kind))
            });
            return Err(HubError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        if reply.kind != result_kind {
            return Err(HubError::UnexpectedResponse {
                expected: result_kind,
                actual: reply.kind,
            });
        }
        Ok(reply.payload()?)
    }

    /// Run a command on an agent.
    ///
    /// A command that ran out of time on the agent comes back as a result
    /// with `timed_out` set; `HubError::Timeout` only means no reply came.
    pub async fn execute_command(
        &self,
        agent_id: &str,
        request: CommandRequest,
    ) -> Result<CommandResult, HubError> {
        let timeout = if request.timeout > 0 {
            Duration::from_secs(request.timeout) + COMMAND_REPLY_GRACE
        } else {
            self.config.request_timeout()
        };

        match self
            .request(agent_id, Payload::CommandExecute(request), Some(timeout))
            .await?
        {
            Payload::CommandResult(result) => Ok(result),
            other => Err(HubError::UnexpectedResponse {
                expected: MessageType::CommandResult,
                actual: other.kind(),
            }),
        }
    }

    /// Stop accepting registrations and drop every agent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Registry {
    agents: HashMap<String, Arc<AgentHandle>>,
    accepting: bool,
    inactivity_timeout: Duration,
}

impl Registry {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.drop_all();
        debug!("Registry stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { agent, reply } => {
                let _ = reply.send(self.register(agent));
            }
            Command::Unregister {
                agent_id,
                connection_id,
            } => self.unregister(&agent_id, connection_id),
            Command::Get { agent_id, reply } => {
                let _ = reply.send(self.agents.get(&agent_id).cloned());
            }
            Command::List { reply } => {
                let mut agents: Vec<_> = self.agents.values().cloned().collect();
                agents.sort_by(|a, b| a.id().cmp(b.id()));
                let _ = reply.send(agents);
            }
            Command::Broadcast { envelope, reply } => {
                let _ = reply.send(self.broadcast(envelope));
            }
            Command::Shutdown { reply } => {
                info!(agents = self.agents.len(), "Registry shutting down");
                self.accepting = false;
                self.drop_all();
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, agent: Arc<AgentHandle>) -> Result<(), HubError> {
        if !self.accepting {
            return Err(HubError::Shutdown);
        }

        let agent_id = agent.id().to_string();
        if let Some(previous) = self.agents.insert(agent_id.clone(), agent.clone()) {
            warn!(
                agent_id = %agent_id,
                old_connection = %previous.connection_id(),
                new_connection = %agent.connection_id(),
                "Agent reconnected, replacing previous connection"
            );
            previous.close();
        }

        info!(
            agent_id = %agent_id,
            connection_id = %agent.connection_id(),
            total = self.agents.len(),
            "Agent registered"
        );
        Ok(())
    }

    fn unregister(&mut self, agent_id: &str, connection_id: Uuid) {
        match self.agents.get(agent_id) {
            Some(current) if current.connection_id() == connection_id => {
                if let Some(agent) = self.agents.remove(agent_id) {
                    agent.close();
                }
                info!(agent_id = %agent_id, total = self.agents.len(), "Agent unregistered");
            }
            Some(_) => {
                debug!(agent_id = %agent_id, %connection_id, "Ignoring unregister for replaced connection");
            }
            None => {}
        }
    }

    fn broadcast(&self, envelope: Envelope) -> usize {
        let mut delivered = 0;
        for agent in self.agents.values() {
            match agent.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(agent_id = %agent.id(), error = %e, "Broadcast delivery failed"),
            }
        }
        delivered
    }

    fn sweep(&mut self) {
        let now = Utc::now();
        let timeout = self.inactivity_timeout;
        let stale: Vec<String> = self
            .agents
            .values()
            .filter(|agent| agent.idle_for(now) > timeout)
            .map(|agent| agent.id().to_string())
            .collect();

        for agent_id in stale {
            if let Some(agent) = self.agents.remove(&agent_id) {
                warn!(
                    agent_id = %agent_id,
                    idle_secs = agent.idle_for(now).as_secs(),
                    "Dropping inactive agent"
                );
                agent.close();
            }
        }
    }

    fn drop_all(&mut self) {
        for (_, agent) in self.agents.drain() {
            agent.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_protocol::payloads::PingPayload;

    fn config() -> HubConfig {
        HubConfig {
            sweep_interval_secs: 3600,
            ..HubConfig::default()
        }
    }

    fn agent(id: &str) -> (Arc<AgentHandle>, AgentChannels) {
        AgentHandle::new(
            AgentDetails {
                id: id.to_string(),
                ..Default::default()
            },
            8,
        )
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let hub = Hub::new(config());
        let (a, _channels) = agent("a");
        hub.register(a.clone()).await.unwrap();

        assert!(hub.get("a").await.is_some());
        assert!(hub.get("b").await.is_none());

        hub.unregister("a", a.connection_id()).await;
        assert!(hub.get("a").await.is_none());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_reregister_replaces_and_ignores_stale_unregister() {
        let hub = Hub::new(config());
        let (old, old_channels) = agent("same");
        let (new, _new_channels) = agent("same");

        hub.register(old.clone()).await.unwrap();
        hub.register(new.clone()).await.unwrap();
        assert!(*old_channels.closed.borrow());

        hub.unregister("same", old.connection_id()).await;
        let current = hub.get("same").await.unwrap();
        assert_eq!(current.connection_id(), new.connection_id());
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let hub = Hub::new(config());
        let (a, mut a_channels) = agent("a");
        let (b, mut b_channels) = agent("b");
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        let envelope = Envelope::new(Payload::Ping(PingPayload::default())).unwrap();
        assert_eq!(hub.broadcast(envelope).await, 2);
        assert_eq!(a_channels.outbound.recv().await.unwrap().agent_id, "a");
        assert_eq!(b_channels.outbound.recv().await.unwrap().agent_id, "b");
    }

    #[tokio::test]
    async fn test_request_to_unknown_agent() {
        let hub = Hub::new(config());
        let err = hub
            .execute_command("ghost", CommandRequest::new("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_request_rejects_non_request_type() {
        let hub = Hub::new(config());
        let err = hub
            .request("a", Payload::CommandResult(CommandResult::default()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotRequest(MessageType::CommandResult)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_agents_and_refuses_registration() {
        let hub = Hub::new(config());
        let (a, _channels) = agent("a");
        hub.register(a.clone()).await.unwrap();

        hub.shutdown().await;
        assert!(a.is_closed());
        assert!(hub.agents().await.is_empty());

        let (b, _channels) = agent("b");
        assert!(matches!(hub.register(b).await, Err(HubError::Shutdown)));
    }

    #[tokio::test]
    async fn test_sweep_drops_silent_agents() {
        let hub = Hub::new(HubConfig {
            inactivity_timeout_secs: 0,
            sweep_interval_secs: 1,
            ..HubConfig::default()
        });
        let (a, channels) = agent("quiet");
        hub.register(a).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(hub.get("quiet").await.is_none());
        assert!(*channels.closed.borrow());
    }
}
