//! CLI Commands

pub mod credential;
pub mod key;
pub mod node;

use anyhow::{Context as _, Result};
use hvconsole_common::{CredentialKey, CredentialStore, Database};
use std::path::PathBuf;

use crate::output::OutputFormat;

/// Paths and output settings shared by all commands
#[derive(Debug, Clone)]
pub struct Context {
    pub db_path: PathBuf,
    pub key_path: PathBuf,
    pub format: OutputFormat,
}

impl Context {
    pub fn open_db(&self) -> Result<Database> {
        Database::open(&self.db_path)
            .with_context(|| format!("failed to open database {}", self.db_path.display()))
    }

    pub async fn load_key(&self) -> Result<CredentialKey> {
        if !self.key_path.exists() {
            anyhow::bail!(
                "credential key {} not found; run `hvconsole key generate` first",
                self.key_path.display()
            );
        }
        CredentialKey::load(&self.key_path)
            .await
            .with_context(|| format!("failed to load credential key {}", self.key_path.display()))
    }

    pub async fn credential_store(&self) -> Result<CredentialStore> {
        let key = self.load_key().await?;
        Ok(CredentialStore::new(self.open_db()?, key))
    }
}

#[cfg(test)]
pub(crate) fn test_context(dir: &tempfile::TempDir) -> Context {
    Context {
        db_path: dir.path().join("state.db"),
        key_path: dir.path().join("credential.key"),
        format: OutputFormat::Plain,
    }
}
