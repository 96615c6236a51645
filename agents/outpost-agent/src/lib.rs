//! Outpost Agent Library
//!
//! The agent side of Outpost: a persistent shell session, the file, service
//! and log handlers, and the session client that connects them to the
//! server.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod shell;

// Re-exports for convenience
pub use agent::dispatch::{Dispatcher, RequestHandler};
pub use agent::state::{AgentState, AgentStateManager};
pub use cli::config::Config;
pub use connection::client::{ClientError, SessionClient};
pub use shell::{CommandExecutor, ShellError, ShellSession};
