//! Agent module
//!
//! Connection state tracking and the handlers behind each request type.

pub mod dispatch;
pub mod error;
pub mod files;
pub mod logs;
pub mod services;
pub mod state;
pub mod status;
