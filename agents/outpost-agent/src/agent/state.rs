//! Agent State Management
//!
//! Connection state machine for the session client, with a short history
//! of transitions for diagnostics.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

const MAX_TRANSITIONS: usize = 100;

/// Where the session client is in its connect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No connection and none in progress
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, waiting for the auth reply
    Authenticating,
    /// Authenticated and serving requests
    Connected,
    /// Connection lost, waiting out the backoff
    Reconnecting,
    /// Stopping for good
    ShuttingDown,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Disconnected => "Disconnected",
            AgentState::Connecting => "Connecting",
            AgentState::Authenticating => "Authenticating",
            AgentState::Connected => "Connected",
            AgentState::Reconnecting => "Reconnecting",
            AgentState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(name)
    }
}

/// A recorded state change
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

struct AgentStateInner {
    current: AgentState,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
    transitions: Vec<StateTransition>,
}

/// Thread-safe agent state manager
#[derive(Clone)]
pub struct AgentStateManager {
    inner: Arc<RwLock<AgentStateInner>>,
}

impl AgentStateManager {
    /// Create a new state manager starting in Disconnected state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(AgentStateInner {
                current: AgentState::Disconnected,
                last_connected: None,
                connection_attempts: 0,
                transitions: Vec::new(),
            })),
        }
    }

    pub fn current_state(&self) -> AgentState {
        self.inner.read().current
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    /// Connection attempts since the last successful connect
    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Move to `new_state` if the transition is allowed.
    pub fn transition_to(&self, new_state: AgentState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();
        let old_state = inner.current;

        if !is_valid_transition(old_state, new_state) {
            tracing::debug!(from = %old_state, to = %new_state, "Ignoring invalid state transition");
            return false;
        }

        inner.current = new_state;
        match new_state {
            AgentState::Connected => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            AgentState::Connecting => {
                inner.connection_attempts += 1;
            }
            _ => {}
        }

        inner.transitions.push(StateTransition {
            from: old_state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if inner.transitions.len() > MAX_TRANSITIONS {
            inner.transitions.remove(0);
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            "Agent state transition"
        );

        true
    }

    pub fn set_connecting(&self) {
        self.transition_to(AgentState::Connecting, Some("Opening connection".to_string()));
    }

    pub fn set_authenticating(&self) {
        self.transition_to(AgentState::Authenticating, Some("Sending credentials".to_string()));
    }

    pub fn set_connected(&self) {
        self.transition_to(AgentState::Connected, Some("Session established".to_string()));
    }

    pub fn set_disconnected(&self, reason: Option<String>) {
        self.transition_to(AgentState::Disconnected, reason);
    }

    pub fn set_reconnecting(&self, reason: Option<String>) {
        self.transition_to(AgentState::Reconnecting, reason);
    }

    pub fn set_shutting_down(&self) {
        self.transition_to(AgentState::ShuttingDown, Some("Shutdown requested".to_string()));
    }

    /// Most recent transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.current_state() == AgentState::ShuttingDown
    }
}

impl Default for AgentStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;

    if from == to {
        return true;
    }
    // Shutdown is reachable from anywhere and final.
    if to == ShuttingDown {
        return true;
    }

    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Connecting, Disconnected)
            | (Connecting, Reconnecting)
            | (Authenticating, Connected)
            | (Authenticating, Disconnected)
            | (Authenticating, Reconnecting)
            | (Connected, Disconnected)
            | (Connected, Reconnecting)
            | (Disconnected, Reconnecting)
            | (Reconnecting, Connecting)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let manager = AgentStateManager::new();
        assert_eq!(manager.current_state(), AgentState::Disconnected);
    }

    #[test]
    fn test_connect_cycle() {
        let manager = AgentStateManager::new();

        assert!(manager.transition_to(AgentState::Connecting, None));
        assert!(manager.transition_to(AgentState::Authenticating, None));
        assert!(manager.transition_to(AgentState::Connected, None));
        assert!(manager.transition_to(AgentState::Reconnecting, None));
        assert!(manager.transition_to(AgentState::Connecting, None));
        assert_eq!(manager.current_state(), AgentState::Connecting);
    }

    #[test]
    fn test_connected_requires_auth() {
        let manager = AgentStateManager::new();
        manager.set_connecting();
        assert!(!manager.transition_to(AgentState::Connected, None));
        assert_eq!(manager.current_state(), AgentState::Connecting);
    }

    #[test]
    fn test_shutdown_is_final() {
        let manager = AgentStateManager::new();
        manager.set_connecting();
        manager.set_shutting_down();
        assert!(manager.is_shutting_down());
        assert!(!manager.transition_to(AgentState::Connecting, None));
    }

    #[test]
    fn test_connection_attempts() {
        let manager = AgentStateManager::new();

        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 1);

        manager.set_reconnecting(None);
        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 2);

        manager.set_authenticating();
        manager.set_connected();
        assert_eq!(manager.connection_attempts(), 0);
        assert!(manager.last_connected().is_some());
    }

    #[test]
    fn test_history_is_capped() {
        let manager = AgentStateManager::new();
        for _ in 0..80 {
            manager.set_connecting();
            manager.set_reconnecting(None);
        }
        assert_eq!(manager.recent_transitions(500).len(), MAX_TRANSITIONS);
        assert_eq!(manager.recent_transitions(1)[0].to, AgentState::Reconnecting);
    }
}
