//! Shell module
//!
//! The persistent interpreter session and the denylist guarding it.

pub mod denylist;
pub mod error;
pub mod session;

pub use denylist::Denylist;
pub use error::ShellError;
pub use session::{CommandExecutor, ShellSession, TIMEOUT_EXIT_CODE};
