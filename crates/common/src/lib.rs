//! hvconsole Common Library
//!
//! Shared data model, persistence, node registry and credential storage for
//! the console relay and its operator tooling.

pub mod credentials;
pub mod db;
pub mod error;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use credentials::{CredentialError, CredentialKey, CredentialStore};
pub use db::Database;
pub use error::{Error, Result};
pub use registry::{NodeRegistry, SqliteNodeRegistry};
pub use types::*;

/// hvconsole version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".hvconsole")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Default credential key path
pub fn default_key_path() -> std::path::PathBuf {
    default_store_path().join("credential.key")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
