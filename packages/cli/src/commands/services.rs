use anyhow::{bail, Result};
use colored::Colorize;
use outpost_protocol::payloads::{
    ServiceAction, ServiceActionRequest, ServiceListRequest, ServiceStatusRequest,
};
use outpost_protocol::Payload;

use crate::api::ApiClient;

/// List services on an agent
pub async fn list(agent_id: &str) -> Result<()> {
    let api = ApiClient::from_config()?;
    let reply = api
        .relay(agent_id, Payload::ServiceList(ServiceListRequest {}), None)
        .await?;
    let Payload::ServiceListResult(result) = reply else {
        bail!("Unexpected `{}` reply", reply.kind());
    };

    if result.services.is_empty() {
        println!("{}", "No services found.".dimmed());
        return Ok(());
    }

    println!("{}", "Services".bold());
    println!("{}", "─".repeat(60));

    for svc in &result.services {
        let state = format!("{}/{}", svc.active_state, svc.sub_state);
        let state_color = match svc.active_state.as_str() {
            "active" => state.green(),
            "failed" => state.red(),
            "activating" | "deactivating" | "reloading" => state.yellow(),
            _ => state.dimmed(),
        };
        println!("  {} [{}]", svc.name.bold(), state_color);
        if !svc.description.is_empty() {
            println!("    {}", svc.description.dimmed());
        }
    }

    println!();
    println!("{} service(s)", result.services.len());

    Ok(())
}

/// Show one service
pub async fn status(agent_id: &str, name: &str) -> Result<()> {
    let api = ApiClient::from_config()?;
    let request = ServiceStatusRequest {
        name: name.to_string(),
    };
    let reply = api
        .relay(agent_id, Payload::ServiceStatus(request), None)
        .await?;
    let Payload::ServiceStatusResult(result) = reply else {
        bail!("Unexpected `{}` reply", reply.kind());
    };

    let svc = result.service;
    println!("{}", svc.name.bold());
    println!("  {:<12} {}", "Loaded".dimmed(), svc.load_state);
    println!("  {:<12} {} ({})", "Active".dimmed(), svc.active_state, svc.sub_state);
    if !svc.description.is_empty() {
        println!("  {:<12} {}", "Description".dimmed(), svc.description);
    }

    Ok(())
}

/// Start, stop, restart, reload, enable or disable a service
pub async fn action(agent_id: &str, name: &str, action: ServiceAction) -> Result<()> {
    let api = ApiClient::from_config()?;
    let request = ServiceActionRequest {
        name: name.to_string(),
        action,
    };

    println!("{} {} {}...", "→".blue().bold(), action, name);
    let reply = api
        .relay(agent_id, Payload::ServiceAction(request), None)
        .await?;
    let Payload::ServiceActionResult(result) = reply else {
        bail!("Unexpected `{}` reply", reply.kind());
    };

    if result.success {
        println!("{} {} {}", "✓".green().bold(), result.action, result.name);
    } else {
        println!("{} {} {} failed", "✗".red().bold(), result.action, result.name);
    }
    if !result.output.trim().is_empty() {
        println!("{}", result.output.trim_end().dimmed());
    }

    Ok(())
}
