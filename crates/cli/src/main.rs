//! hvconsole CLI - Main Entry Point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use hvconsole_cli::commands::{credential, key, node, Context};
use hvconsole_cli::output::{self, print_error};

/// hvconsole - operator CLI for the console relay
#[derive(Parser)]
#[command(name = "hvconsole")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path
    #[arg(long, env = "HVCONSOLE_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Credential key file
    #[arg(long, env = "HVCONSOLE_KEY_PATH", global = true)]
    key_path: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the credential encryption key
    #[command(subcommand)]
    Key(key::KeyCommands),

    /// Manage hypervisor nodes
    #[command(subcommand)]
    Node(node::NodeCommands),

    /// Manage stored node credentials
    #[command(subcommand)]
    Credential(credential::CredentialCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context {
        db_path: cli.db_path.unwrap_or_else(hvconsole_common::default_db_path),
        key_path: cli.key_path.unwrap_or_else(hvconsole_common::default_key_path),
        format: cli.format,
    };
    debug!("Database {}, key {}", ctx.db_path.display(), ctx.key_path.display());

    let result = match cli.command {
        Commands::Key(cmd) => key::execute(cmd, &ctx).await,
        Commands::Node(cmd) => node::execute(cmd, &ctx).await,
        Commands::Credential(cmd) => credential::execute(cmd, &ctx).await,
        Commands::Version => {
            println!("hvconsole CLI v{}", hvconsole_common::VERSION);
            Ok(())
        }
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
