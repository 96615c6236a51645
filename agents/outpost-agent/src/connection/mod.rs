//! Connection module
//!
//! The agent's side of the session: dialing, authentication, and the
//! request/heartbeat/status loop.

pub mod client;

pub use client::{ClientError, SessionClient};
