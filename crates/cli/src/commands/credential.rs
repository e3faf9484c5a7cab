//! Credential Commands
//!
//! Secrets are read from stdin, never from the command line.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use hvconsole_common::CredentialStore;
use std::io::{BufRead, IsTerminal, Write};
use zeroize::Zeroizing;

use super::Context;
use crate::output::{print_error, print_success};

#[derive(Subcommand)]
pub enum CredentialCommands {
    /// Encrypt and store a node password read from stdin
    Set {
        /// Credential name referenced by nodes
        name: String,
    },

    /// Verify that a stored credential decrypts with the current key
    Check {
        /// Credential name
        name: String,
    },

    /// Delete a stored credential
    Remove {
        /// Credential name
        name: String,
    },
}

pub async fn execute(cmd: CredentialCommands, ctx: &Context) -> Result<()> {
    let store = ctx.credential_store().await?;

    match cmd {
        CredentialCommands::Set { name } => {
            let secret = read_secret(&name)?;
            let blob = set(&store, &name, &secret)?;
            print_success(&format!("Credential {} stored ({} bytes sealed)", name, blob));
        }

        CredentialCommands::Check { name } => match store.retrieve(&name) {
            Ok(_) => println!("{} {}", "✓".green(), name),
            Err(e) => {
                print_error(&format!("{}: {}", name, e));
                std::process::exit(1);
            }
        },

        CredentialCommands::Remove { name } => {
            if store.remove(&name)? {
                print_success(&format!("Credential {} removed", name));
            } else {
                anyhow::bail!("credential {} does not exist", name);
            }
        }
    }

    Ok(())
}

/// Seal and persist `secret`; returns the sealed blob length
pub fn set(store: &CredentialStore, name: &str, secret: &str) -> Result<usize> {
    let blob = store.store(name, secret)?;
    Ok(blob.len())
}

fn read_secret(name: &str) -> Result<Zeroizing<String>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Secret for {}: ", name);
        std::io::stderr().flush()?;
    }

    let mut line = Zeroizing::new(String::new());
    stdin.lock().read_line(&mut line)?;
    let secret = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if secret.is_empty() {
        anyhow::bail!("no secret provided on stdin");
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{key, test_context};

    #[tokio::test]
    async fn test_set_check_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        key::generate(&ctx, false).await.unwrap();

        let store = ctx.credential_store().await.unwrap();
        let sealed = set(&store, "pve1-root", "s3cret").unwrap();
        assert!(sealed > "s3cret".len());

        // A second store over the same files sees the credential
        let reopened = ctx.credential_store().await.unwrap();
        assert_eq!(reopened.retrieve("pve1-root").unwrap().as_str(), "s3cret");

        execute(CredentialCommands::Remove { name: "pve1-root".to_string() }, &ctx)
            .await
            .unwrap();
        assert!(!reopened.contains("pve1-root").unwrap());
    }

    #[tokio::test]
    async fn test_rekey_makes_credentials_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        key::generate(&ctx, false).await.unwrap();
        set(&ctx.credential_store().await.unwrap(), "pve1-root", "s3cret").unwrap();

        key::generate(&ctx, true).await.unwrap();
        let store = ctx.credential_store().await.unwrap();
        assert!(store.retrieve("pve1-root").is_err());
    }

    #[tokio::test]
    async fn test_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let err = execute(CredentialCommands::Check { name: "x".to_string() }, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hvconsole key generate"));
    }
}
