//! CLI entry and dispatch.

use std::path::PathBuf;

use agentlink_core::config;
use agentlink_core::core::interrupt;
use agentlink_core::logging::{self, WorkerGuard};
use anyhow::{Context, Result};
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "agentlink")]
#[command(version = "0.1")]
#[command(about = "Stream coding-assistant backends through one event model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory the backend runs in (default: current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Sends a prompt and streams the reply
    Exec {
        /// The prompt to send to the backend
        #[arg(short, long)]
        prompt: String,

        /// Continue a stored session by ID
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Print every stream event as a JSON line on stdout
        #[arg(long)]
        json: bool,
    },

    /// Probes the transports and prints the selected mode
    Probe,

    /// Browse stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Lists sessions of the project, newest first
    List {
        /// List sessions of every project
        #[arg(long)]
        all: bool,
    },
    /// Shows a specific session
    Show {
        /// The ID of the session to show
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli { command, root } = cli;

    match command {
        Commands::Exec {
            prompt,
            session,
            json,
        } => {
            let (config, _log_guard) = load_config()?;
            commands::exec::run(commands::exec::ExecRunOptions {
                root: &root,
                prompt: &prompt,
                session: session.as_deref(),
                json,
                config: &config,
            })
            .await
        }

        Commands::Probe => {
            let (config, _log_guard) = load_config()?;
            commands::exec::probe(&root, &config).await
        }

        Commands::Sessions { command } => {
            let (config, _log_guard) = load_config()?;
            match command {
                SessionCommands::List { all } => commands::sessions::list(&root, all, &config),
                SessionCommands::Show { id } => commands::sessions::show(&id, &config),
            }
        }

        // config commands must work even when the file is broken
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

fn load_config() -> Result<(config::Config, WorkerGuard)> {
    let config = config::Config::load().context("load config")?;
    let guard = logging::init(&config).context("init logging")?;
    Ok((config, guard))
}
