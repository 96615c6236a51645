use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use outpost_protocol::payloads::ServiceAction;
use tracing_subscriber::EnvFilter;

mod api;
mod commands;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "outpost", about = "Outpost CLI - run commands on your agents")]
#[command(version, propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate with an Outpost server
    Login {
        /// Server URL (default: http://localhost:8080)
        #[arg(long)]
        server_url: Option<String>,
    },

    /// List connected agents, or show one
    Agents {
        /// Agent ID
        id: Option<String>,
    },

    /// Run a command in an agent's shell
    Exec {
        /// Agent ID
        agent: String,

        /// Seconds before the command is killed (0 = agent default)
        #[arg(short, long, default_value = "30")]
        timeout: u64,

        /// Directory to run in
        #[arg(long)]
        cwd: Option<String>,

        /// Extra environment, KEY=VALUE
        #[arg(short, long)]
        env: Vec<String>,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Browse log files on an agent
    Logs {
        /// Agent ID (default: default_agent from config)
        #[arg(short, long)]
        agent: Option<String>,

        /// Log file to print; lists files when absent
        path: Option<String>,

        /// Number of log lines to fetch
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Directory to list
        #[arg(short, long)]
        directory: Option<String>,
    },

    /// Inspect and control services on an agent
    Services {
        /// Agent ID (default: default_agent from config)
        #[arg(short, long)]
        agent: Option<String>,

        /// Service name; lists services when absent
        name: Option<String>,

        /// Action to apply to the service
        #[arg(value_enum)]
        action: Option<ActionArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl From<ActionArg> for ServiceAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Start => ServiceAction::Start,
            ActionArg::Stop => ServiceAction::Stop,
            ActionArg::Restart => ServiceAction::Restart,
            ActionArg::Reload => ServiceAction::Reload,
            ActionArg::Enable => ServiceAction::Enable,
            ActionArg::Disable => ServiceAction::Disable,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match cli.command {
        Commands::Login { server_url } => commands::login::run(server_url).await,
        Commands::Agents { id: None } => commands::agents::list().await,
        Commands::Agents { id: Some(id) } => commands::agents::show(&id).await,
        Commands::Exec {
            agent,
            timeout,
            cwd,
            env,
            command,
        } => {
            let options = commands::exec::ExecOptions {
                timeout,
                working_dir: cwd,
                env,
            };
            let code = commands::exec::run(&agent, command, options).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Logs {
            agent,
            path,
            lines,
            directory,
        } => {
            let config = Config::load()?;
            let agent = config.agent(agent.as_deref())?;
            match path {
                Some(path) => commands::logs::tail(agent, &path, lines).await,
                None => commands::logs::list(agent, directory).await,
            }
        }
        Commands::Services {
            agent,
            name,
            action,
        } => {
            let config = Config::load()?;
            let agent = config.agent(agent.as_deref())?;
            match (name, action) {
                (None, _) => commands::services::list(agent).await,
                (Some(name), None) => commands::services::status(agent, &name).await,
                (Some(name), Some(action)) => {
                    commands::services::action(agent, &name, action.into()).await
                }
            }
        }
    }
}
