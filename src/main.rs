use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agencyhub")]
#[command(version, about = "Multi-tenant agency and sub-account back-end")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to agencyhub.toml. Defaults to .agencyhub/agencyhub.toml in the project directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .agencyhub/ with a default config and an initialized database
    Init {
        /// Database path (overrides the config)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Serve the HTTP API
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local front-end)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
    /// Initialize a default agencyhub.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?;
        }
        Commands::Init { db_path } => {
            cmd::cmd_init(&project_dir, cli.config.as_deref(), db_path.clone())?;
        }
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            let overrides = cmd::ServeOverrides {
                port: *port,
                host: host.clone(),
                db_path: db_path.clone(),
                dev: *dev,
            };
            cmd::cmd_serve(&project_dir, cli.config.as_deref(), cli.verbose, overrides).await?;
        }
    }

    Ok(())
}
