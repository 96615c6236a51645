//! Service Manager
//!
//! Lists, inspects and controls system services. The systemd backend shells
//! out to `systemctl`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use outpost_protocol::payloads::{ServiceAction, ServiceActionResult, ServiceInfo};

use super::error::HandlerError;

/// Backend for the `service_*` requests.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn list(&self) -> Result<Vec<ServiceInfo>, HandlerError>;

    async fn status(&self, name: &str) -> Result<ServiceInfo, HandlerError>;

    async fn action(
        &self,
        name: &str,
        action: ServiceAction,
    ) -> Result<ServiceActionResult, HandlerError>;
}

/// systemd via `systemctl`.
pub struct SystemdManager {
    program: String,
    timeout: Duration,
}

impl SystemdManager {
    pub fn new() -> Self {
        Self {
            program: "systemctl".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Use a different `systemctl` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(bool, String), HandlerError> {
        debug!(program = %self.program, ?args, "Running systemctl");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(args)
                .env("SYSTEMD_COLORS", "0")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| HandlerError::CommandFailed {
            command: format!("{} {}", self.program, args.join(" ")),
            output: "timed out".to_string(),
        })??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn list(&self) -> Result<Vec<ServiceInfo>, HandlerError> {
        let (ok, output) = self
            .systemctl(&[
                "list-units",
                "--type=service",
                "--all",
                "--no-legend",
                "--no-pager",
                "--plain",
            ])
            .await?;
        if !ok {
            return Err(HandlerError::CommandFailed {
                command: "systemctl list-units".to_string(),
                output,
            });
        }
        Ok(parse_list_units(&output))
    }

    async fn status(&self, name: &str) -> Result<ServiceInfo, HandlerError> {
        validate_service_name(name)?;
        let (ok, output) = self
            .systemctl(&[
                "show",
                name,
                "--property=Id,Description,LoadState,ActiveState,SubState",
                "--no-pager",
            ])
            .await?;
        if !ok {
            return Err(HandlerError::CommandFailed {
                command: format!("systemctl show {name}"),
                output,
            });
        }

        let info = parse_show(name, &output);
        if info.load_state == "not-found" {
            return Err(HandlerError::NotFound(format!("service {name}")));
        }
        Ok(info)
    }

    async fn action(
        &self,
        name: &str,
        action: ServiceAction,
    ) -> Result<ServiceActionResult, HandlerError> {
        validate_service_name(name)?;
        let (success, output) = self.systemctl(&[action.as_str(), name]).await?;
        info!(service = %name, %action, success, "Service action");
        Ok(ServiceActionResult {
            name: name.to_string(),
            action,
            success,
            output: output.trim().to_string(),
        })
    }
}

/// Unit names: no option lookalikes, no shell or path syntax.
pub fn validate_service_name(name: &str) -> Result<(), HandlerError> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':' | '\\'));
    if valid {
        Ok(())
    } else {
        Err(HandlerError::InvalidRequest(format!(
            "invalid service name: {name:?}"
        )))
    }
}

/// Parse `systemctl list-units --plain --no-legend` output.
pub fn parse_list_units(output: &str) -> Vec<ServiceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let load_state = fields.next()?;
            let active_state = fields.next()?;
            let sub_state = fields.next()?;
            let description = fields.collect::<Vec<_>>().join(" ");
            Some(ServiceInfo {
                name: name.to_string(),
                description,
                load_state: load_state.to_string(),
                active_state: active_state.to_string(),
                sub_state: sub_state.to_string(),
            })
        })
        .collect()
}

/// Parse `systemctl show --property=...` output.
pub fn parse_show(name: &str, output: &str) -> ServiceInfo {
    let props: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();
    let get = |key: &str| props.get(key).map(|v| v.to_string()).unwrap_or_default();

    let id = get("Id");
    ServiceInfo {
        name: if id.is_empty() { name.to_string() } else { id },
        description: get("Description"),
        load_state: get("LoadState"),
        active_state: get("ActiveState"),
        sub_state: get("SubState"),
    }
}
