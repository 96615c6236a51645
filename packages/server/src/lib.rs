//! Outpost Server Library
//!
//! Accepts agent connections, keeps the registry of who is connected, and
//! routes correlated requests to agents on behalf of the relay API.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod transport;

// Re-exports for convenience
pub use api::{router, AppState};
pub use auth::{AuthError, Authenticator};
pub use config::Config;
pub use connection::serve_connection;
pub use error::{ApiError, HubError};
pub use hub::{AgentHandle, AgentInfo, Hub};
