//! CLI module
//!
//! Agent configuration.

pub mod config;

pub use config::Config;
