//! Credential key commands

use anyhow::Result;
use clap::Subcommand;
use hvconsole_common::CredentialKey;

use super::Context;
use crate::output::{print_success, print_warning};

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a new credential encryption key
    Generate {
        /// Replace an existing key. Credentials sealed with it become unreadable.
        #[arg(long)]
        force: bool,
    },
}

pub async fn execute(cmd: KeyCommands, ctx: &Context) -> Result<()> {
    match cmd {
        KeyCommands::Generate { force } => {
            let replaced = generate(ctx, force).await?;
            if replaced {
                print_warning("Existing key replaced; re-run `hvconsole credential set` for every node");
            }
            print_success(&format!("Credential key written to {}", ctx.key_path.display()));
        }
    }
    Ok(())
}

/// Write a fresh key. Returns whether an existing key was replaced.
pub async fn generate(ctx: &Context, force: bool) -> Result<bool> {
    let exists = ctx.key_path.exists();
    if exists && !force {
        anyhow::bail!(
            "credential key {} already exists; pass --force to replace it",
            ctx.key_path.display()
        );
    }

    CredentialKey::generate().save(&ctx.key_path).await?;
    Ok(exists)
}
