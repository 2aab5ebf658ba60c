use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veil_chain::config::NodeConfig;
use veil_chain::crypto::Kdf;
use veil_chain::node::Node;

#[derive(Parser)]
#[command(author, version, about = "Confidential UTXO chain-state node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a fresh key-derivation seed
    Keygen {
        #[arg(short, long, default_value = "keys/seed.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };

    let node = Node::new(config)?;
    let handle = node.handle();
    if let Some(tip) = handle.current_state() {
        info!(%tip, "chain state ready");
    }

    tokio::select! {
        result = node.start() => result?,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let kdf = Kdf::generate();
    kdf.save(&path)?;
    info!(?path, seed_id = %hex::encode(kdf.seed_id()), "generated key seed");
    Ok(())
}
