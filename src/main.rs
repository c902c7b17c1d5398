use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "taskhub")]
#[command(version, about = "Project and task hub with a real-time activity stream")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to taskhub.toml (defaults to .taskhub/taskhub.toml)
    #[arg(long, global = true, env = "TASKHUB_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub server (REST API and /ws)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Permissive CORS for a local frontend dev server
        #[arg(long)]
        dev: bool,
    },
    /// Create .taskhub/ with a default config and an empty database
    Init,
    /// Follow the activity stream with a live dashboard
    Watch {
        /// WebSocket URL (overrides config and TASKHUB_WS_URL)
        #[arg(long)]
        url: Option<String>,

        /// REST base URL used to derive the socket URL and refetch stats
        #[arg(long)]
        api_url: Option<String>,

        /// Also subscribe to this project's activity (repeatable)
        #[arg(long = "project")]
        projects: Vec<i64>,

        #[arg(long)]
        token: Option<String>,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default taskhub.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Values from .env feed both clap's `env` args and the config layer.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    taskhub::logging::init_logging(cli.verbose, cli.log_json)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            let overrides = cmd::ServeOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                dev: *dev,
            };
            cmd::cmd_serve(&project_dir, cli.config.as_deref(), overrides).await?;
        }
        Commands::Init => cmd::cmd_init(&project_dir, cli.config.as_deref())?,
        Commands::Watch {
            url,
            api_url,
            projects,
            token,
        } => {
            let overrides = cmd::WatchOverrides {
                url: url.clone(),
                api_url: api_url.clone(),
                projects: projects.clone(),
                token: token.clone(),
            };
            cmd::cmd_watch(&project_dir, cli.config.as_deref(), overrides).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?
        }
    }

    Ok(())
}
