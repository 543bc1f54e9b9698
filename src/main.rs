use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use anvil::config::EngineConfig;
use anvil::engine::server;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Self-hosted continuous integration engine")]
pub struct Cli {
    /// Path to a config file (defaults to ./anvil.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build engine and its HTTP API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces and enable permissive CORS
        #[arg(long)]
        dev: bool,

        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Root directory for per-repo workspaces
        #[arg(long)]
        workspaces: Option<PathBuf>,

        /// Maximum number of builds executing concurrently
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("anvil=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            port,
            dev,
            db,
            workspaces,
            workers,
        } => {
            let mut config = EngineConfig::load(cli.config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            if dev {
                config.dev_mode = true;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(workspaces) = workspaces {
                config.workspaces_root = workspaces;
            }
            if let Some(workers) = workers {
                config.max_concurrent_builds = workers.max(1);
            }
            server::start_server(config).await
        }
    }
}
