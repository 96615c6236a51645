//! Outpost Server Entry Point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use outpost_server::config::{Config, LoggingConfig};
use outpost_server::{router, AppState, Authenticator, Hub};

#[derive(Parser)]
#[command(name = "outpost-server")]
#[command(author, version, about = "Outpost Server - agent registry and request relay")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent connections and serve the relay API
    Serve {
        /// Listen address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,

        /// Shared API key (overrides the config file)
        #[arg(long, env = "OUTPOST_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Token signing secret (overrides the config file)
        #[arg(long, env = "OUTPOST_JWT_SECRET", hide_env_values = true)]
        jwt_secret: Option<String>,
    },
    /// Mint a signed agent token
    Token {
        /// Agent id the token is bound to
        #[arg(long)]
        agent_id: String,

        /// Token lifetime in seconds (defaults to auth.token_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,

        /// Token signing secret (overrides the config file)
        #[arg(long, env = "OUTPOST_JWT_SECRET", hide_env_values = true)]
        jwt_secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve {
            bind,
            api_key,
            jwt_secret,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if api_key.is_some() {
                config.auth.api_key = api_key;
            }
            if jwt_secret.is_some() {
                config.auth.jwt_secret = jwt_secret;
            }
            init_logging(&config.logging, cli.verbose)?;
            serve(config).await
        }
        Commands::Token {
            agent_id,
            ttl_secs,
            jwt_secret,
        } => {
            if jwt_secret.is_some() {
                config.auth.jwt_secret = jwt_secret;
            }
            let auth = Authenticator::new(&config.auth);
            let token = auth
                .mint(&agent_id, ttl_secs.map(Duration::from_secs))
                .context("Failed to mint token (is auth.jwt_secret set?)")?;
            println!("{token}");
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        eprintln!("Config file {} not found, using defaults", path.display());
        Ok(Config::default())
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

async fn serve(config: Config) -> Result<()> {
    let auth = Arc::new(Authenticator::new(&config.auth));
    if !auth.is_configured() {
        bail!("No agent credential configured; set auth.api_key or auth.jwt_secret");
    }
    let require_api_key = config.auth.api_key.as_deref().is_some_and(|k| !k.is_empty());
    if !require_api_key {
        warn!("No API key configured; the relay API is open to anyone who can reach it");
    }

    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind))?;

    let hub = Hub::new(config.hub.clone());
    let app = router(AppState {
        hub: hub.clone(),
        auth,
        require_api_key,
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Outpost Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        // Agent sockets stay open until the registry drops them.
        hub.shutdown().await;
    })
    .await
    .context("Server error")?;

    info!("Outpost Server stopped");
    Ok(())
}
