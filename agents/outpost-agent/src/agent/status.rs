//! Status Reports
//!
//! Builds the periodic status push.

use std::time::Instant;

use outpost_protocol::payloads::StatusReport;

use crate::shell::CommandExecutor;

/// Static host facts plus the agent's start time.
pub struct StatusCollector {
    hostname: String,
    version: String,
    started: Instant,
}

impl StatusCollector {
    pub fn new() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            hostname,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: Instant::now(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn report(&self, shell: &dyn CommandExecutor) -> StatusReport {
        StatusReport {
            hostname: self.hostname.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: self.version.clone(),
            uptime_secs: self.uptime_secs(),
            shell: shell.status(),
        }
    }
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new()
    }
}
