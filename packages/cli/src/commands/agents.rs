use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use outpost_protocol::payloads::StatusReport;
use serde::Deserialize;

use crate::api::ApiClient;

#[derive(Debug, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub pending_requests: usize,
    pub status: Option<StatusReport>,
}

/// List connected agents
pub async fn list() -> Result<()> {
    let api = ApiClient::from_config()?;
    let agents: Vec<Agent> = api.get("/api/agents").await?;

    if agents.is_empty() {
        println!("{}", "No agents connected.".dimmed());
        return Ok(());
    }

    println!("{}", "Agents".bold());
    println!("{}", "─".repeat(78));
    println!(
        "  {:<20} {:<20} {:<10} {:>10} {:>10}",
        "ID".dimmed(),
        "HOSTNAME".dimmed(),
        "SHELL".dimmed(),
        "UPTIME".dimmed(),
        "SEEN".dimmed(),
    );
    println!("{}", "─".repeat(78));

    let now = Utc::now();
    for agent in &agents {
        let hostname = agent
            .hostname
            .clone()
            .or_else(|| agent.status.as_ref().map(|s| s.hostname.clone()))
            .unwrap_or_else(|| "-".to_string());

        let shell = agent
            .status
            .as_ref()
            .map(|s| s.shell.state.clone())
            .unwrap_or_else(|| "-".to_string());
        let shell_color = match shell.as_str() {
            "ready" => shell.green(),
            "closed" => shell.red(),
            "uninitialized" => shell.yellow(),
            _ => shell.dimmed(),
        };

        let uptime = agent
            .status
            .as_ref()
            .map(|s| format_duration(s.uptime_secs))
            .unwrap_or_else(|| "-".to_string());

        let seen = (now - agent.last_seen).num_seconds().max(0) as u64;

        println!(
            "  {:<20} {:<20} {:<10} {:>10} {:>10}",
            agent.id,
            hostname,
            shell_color,
            uptime,
            format!("{} ago", format_duration(seen)),
        );
    }

    println!();
    println!("{} agent(s)", agents.len());

    Ok(())
}

/// Show one agent in detail
pub async fn show(agent_id: &str) -> Result<()> {
    let api = ApiClient::from_config()?;
    let agent: Agent = api.get(&format!("/api/agents/{}", agent_id)).await?;

    println!("{}", agent.id.bold());
    println!("{}", "─".repeat(50));
    print_field("Name", agent.name.as_deref());
    print_field("Hostname", agent.hostname.as_deref());
    print_field("Version", agent.version.as_deref());
    print_field("Address", agent.peer.as_deref());
    println!("  {:<14} {}", "Connected".dimmed(), agent.connected_at.to_rfc3339());
    println!("  {:<14} {}", "Last seen".dimmed(), agent.last_seen.to_rfc3339());
    println!("  {:<14} {}", "In flight".dimmed(), agent.pending_requests);

    if let Some(status) = &agent.status {
        println!();
        println!("{}", "Status".bold());
        println!("  {:<14} {}/{}", "Platform".dimmed(), status.os, status.arch);
        println!("  {:<14} {}", "Uptime".dimmed(), format_duration(status.uptime_secs));
        println!("  {:<14} {}", "Shell".dimmed(), status.shell.state);
        print_field("Directory", status.shell.cwd.as_deref());
        println!("  {:<14} {}", "Commands run".dimmed(), status.shell.commands_run);
    }

    Ok(())
}

fn print_field(label: &str, value: Option<&str>) {
    println!("  {:<14} {}", label.dimmed(), value.unwrap_or("-"));
}

fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", seconds)
    }
}
