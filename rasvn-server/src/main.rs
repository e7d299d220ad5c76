//! rasvn server — serves a repository over the rasvn wire protocol.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rasvn_core::{InMemoryRepository, RepoOracle};
use rasvn_server::{session, Config};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rasvn-server")]
#[command(about = "Version-control protocol server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        addr: Option<String>,

        /// Configuration file (TOML)
        #[arg(short = 'c', long)]
        config: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a default configuration file
    #[command(name = "init-config")]
    InitConfig {
        /// Config file path
        #[arg(short, long, default_value = "rasvn.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, config, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let mut cfg = match config {
                Some(path) => Config::from_file(Path::new(&path))?,
                None => Config::default(),
            };
            if let Some(addr) = addr {
                cfg.addr = addr;
            }
            serve(cfg).await
        }
        Commands::InitConfig { output } => {
            let raw = toml::to_string_pretty(&Config::default())?;
            std::fs::write(&output, raw)
                .with_context(|| format!("failed to write {output}"))?;
            println!("wrote default configuration to {output}");
            Ok(())
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let opts = cfg.txn_options()?;
    let repo = Arc::new(InMemoryRepository::new());
    info!(uuid = %repo.uuid(), "repository created");

    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.addr))?;
    info!(addr = %cfg.addr, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let repo = repo.clone();
        tokio::spawn(async move {
            info!(%peer, "session opened");
            match session::run_session(stream, repo, opts).await {
                Ok(()) => info!(%peer, "session closed"),
                Err(err) => error!(%peer, error = %err, "session failed"),
            }
        });
    }
}
