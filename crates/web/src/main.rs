//! hvconsole relay server
//!
//! Serves authenticated websocket consoles for guests on registered
//! hypervisor nodes.

use anyhow::Context;
use clap::Parser;
use hvconsole_common::CredentialKey;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hvconsole_web::config::RelayConfig;

#[derive(Parser)]
#[command(name = "hvconsole-web")]
#[command(about = "hvconsole relay - authenticated hypervisor console websockets")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "HVCONSOLE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Credential key file
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("hvconsole relay v{}", hvconsole_common::VERSION);

    // File, then environment, then flags
    let config_path = cli
        .config
        .unwrap_or_else(|| hvconsole_common::default_store_path().join("config.toml"));
    let mut config = RelayConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.apply_env();

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(key_path) = cli.key_path {
        config.key_path = key_path;
    }
    config.validate()?;

    if !config.key_path.exists() {
        anyhow::bail!(
            "credential key {} not found; run `hvconsole key generate` first",
            config.key_path.display()
        );
    }
    let key = CredentialKey::load(&config.key_path)
        .await
        .with_context(|| format!("failed to load credential key {}", config.key_path.display()))?;

    info!("Database: {}", config.db_path.display());
    hvconsole_web::server::serve(config, key).await
}
