//! Outpost Agent CLI Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use outpost_agent::agent::dispatch::RequestHandler;
use outpost_agent::agent::state::AgentStateManager;
use outpost_agent::cli::config::{Config, LoggingConfig};
use outpost_agent::connection::client::SessionClient;
use outpost_agent::shell::ShellSession;
use outpost_protocol::payloads::CommandRequest;

#[derive(Parser)]
#[command(name = "outpost-agent")]
#[command(author, version, about = "Outpost Agent - persistent shell sessions for the Outpost server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agent.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the server and serve requests
    Start {
        /// Credential sent in the auth handshake (overrides the config file)
        #[arg(long, env = "OUTPOST_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Server WebSocket URL (overrides the config file)
        #[arg(long)]
        url: Option<String>,
    },
    /// Run one command through a local shell session
    Exec {
        /// Command line to run
        command: String,

        /// Timeout in seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        show_version();
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Start { token, url } => start_agent(config, token, url).await?,
        Commands::Exec { command, timeout } => {
            let code = exec_local(config, command, timeout).await?;
            std::process::exit(code);
        }
        Commands::Version => show_version(),
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        eprintln!(
            "Config file {} not found, using defaults",
            path.display()
        );
        Ok(Config::default_config())
    }
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

async fn start_agent(mut config: Config, token: Option<String>, url: Option<String>) -> Result<()> {
    if let Some(token) = token {
        config.server.token = token;
    }
    if let Some(url) = url {
        config.server.url = url;
    }
    if config.server.token.is_empty() {
        warn!("No server token configured; authentication will fail");
    }

    info!(agent_id = %config.agent_id, name = %config.name, "Starting Outpost Agent");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = AgentStateManager::new();
    let handler = Arc::new(RequestHandler::from_config(&config));
    let client = SessionClient::new(
        config.agent_id.clone(),
        config.name.clone(),
        config.server.clone(),
        handler,
        state.clone(),
        shutdown_rx,
    );

    client.run().await.context("Agent stopped")?;
    info!(state = %state.current_state(), "Agent stopped");
    Ok(())
}

async fn exec_local(config: Config, command: String, timeout: u64) -> Result<i32> {
    let shell = ShellSession::new(config.shell);
    let result = shell
        .execute(CommandRequest::new(command).with_timeout(timeout))
        .await
        .context("Command failed")?;
    shell.close().await;

    print!("{}", result.stdout);
    if result.timed_out {
        eprintln!("timed out after {} ms", result.duration);
    }
    Ok(result.exit_code)
}

fn show_version() {
    println!("outpost-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Agent for Outpost remote shell sessions");
    println!();
    println!("Features:");
    println!("  - Persistent shell session with per-command framing");
    println!("  - Chunked file uploads, service and log inspection");
    println!("  - Authenticated WebSocket session with automatic reconnection");
}
