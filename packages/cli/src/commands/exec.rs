use anyhow::{bail, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use outpost_protocol::payloads::{CommandRequest, CommandResult};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::api::ApiClient;

pub struct ExecOptions {
    pub timeout: u64,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
}

/// Run a command on an agent. Returns the remote exit code.
pub async fn run(agent_id: &str, command: Vec<String>, options: ExecOptions) -> Result<i32> {
    let api = ApiClient::from_config()?;
    let request = build_request(command, options)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.blue} {msg}")?,
    );
    spinner.set_message(format!("Running on {}", agent_id.bold()));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let result: Result<CommandResult> = api
        .post(&format!("/api/agents/{}/exec", agent_id), &request)
        .await;
    spinner.finish_and_clear();
    let result = result?;

    print!("{}", result.stdout);
    if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
        println!();
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }

    if result.timed_out {
        eprintln!(
            "{} timed out after {} ms",
            "✗".red().bold(),
            result.duration
        );
    } else if result.exit_code != 0 {
        eprintln!(
            "{} exit code {} ({} ms)",
            "✗".red().bold(),
            result.exit_code,
            result.duration
        );
    }
    if let Some(dir) = &result.working_dir {
        tracing::debug!(working_dir = %dir, "Remote directory after command");
    }

    Ok(result.exit_code)
}

fn build_request(command: Vec<String>, options: ExecOptions) -> Result<CommandRequest> {
    if command.is_empty() {
        bail!("No command given");
    }

    let mut env = BTreeMap::new();
    for pair in options.env {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid --env `{}`, expected KEY=VALUE", pair);
        };
        env.insert(key.to_string(), value.to_string());
    }

    Ok(CommandRequest {
        command: command.join(" "),
        args: Vec::new(),
        working_dir: options.working_dir.unwrap_or_default(),
        env,
        timeout: options.timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ExecOptions {
        ExecOptions {
            timeout: 30,
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[test]
    fn test_build_request_joins_words() {
        let request = build_request(vec!["ls".into(), "-la".into()], options()).unwrap();
        assert_eq!(request.command, "ls -la");
        assert_eq!(request.timeout, 30);
        assert!(request.working_dir.is_empty());
    }

    #[test]
    fn test_build_request_env() {
        let mut opts = options();
        opts.env = vec!["A=1".into(), "B=x=y".into()];
        opts.working_dir = Some("/srv".into());
        let request = build_request(vec!["env".into()], opts).unwrap();
        assert_eq!(request.env["A"], "1");
        assert_eq!(request.env["B"], "x=y");
        assert_eq!(request.working_dir, "/srv");

        let mut bad = options();
        bad.env = vec!["NOEQUALS".into()];
        assert!(build_request(vec!["env".into()], bad).is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(build_request(Vec::new(), options()).is_err());
    }
}
