use anyhow::{bail, Result};
use colored::Colorize;
use outpost_protocol::payloads::{LogContentRequest, LogListRequest};
use outpost_protocol::Payload;

use crate::api::ApiClient;

/// List log files on an agent
pub async fn list(agent_id: &str, directory: Option<String>) -> Result<()> {
    let api = ApiClient::from_config()?;
    let reply = api
        .relay(agent_id, Payload::LogList(LogListRequest { directory }), None)
        .await?;
    let Payload::LogListResult(result) = reply else {
        bail!("Unexpected `{}` reply", reply.kind());
    };

    if result.files.is_empty() {
        println!("{}", "No log files found.".dimmed());
        return Ok(());
    }

    for file in &result.files {
        let modified = file
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<50} {:>10} {}",
            file.path,
            format_size(file.size),
            modified.dimmed()
        );
    }
    println!();
    println!("{} file(s)", result.files.len());

    Ok(())
}

/// Print the tail of a log file on an agent
pub async fn tail(agent_id: &str, path: &str, lines: usize) -> Result<()> {
    let api = ApiClient::from_config()?;
    let request = LogContentRequest {
        path: path.to_string(),
        lines: Some(lines),
    };
    let reply = api
        .relay(agent_id, Payload::LogContent(request), None)
        .await?;
    let Payload::LogContentResult(result) = reply else {
        bail!("Unexpected `{}` reply", reply.kind());
    };

    for line in result.content.lines() {
        println!("{}", colorize(line));
    }
    if result.truncated {
        eprintln!(
            "{}",
            format!("(showing last {} lines of {})", result.lines, result.path).dimmed()
        );
    }

    Ok(())
}

fn colorize(line: &str) -> colored::ColoredString {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        line.red()
    } else if lower.contains("warn") {
        line.yellow()
    } else {
        line.normal()
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0K");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0M");
    }
}
