//! Relay server configuration
//!
//! Built once at process start (file, then environment, then CLI flags) and
//! passed explicitly into each component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP listen address
    pub listen: String,

    /// SQLite database holding nodes and credentials
    pub db_path: PathBuf,

    /// Credential encryption key file
    pub key_path: PathBuf,

    /// Hypervisor control API settings
    pub hypervisor: HypervisorConfig,

    /// Relay bridge settings
    pub relay: BridgeConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
            db_path: hvconsole_common::default_db_path(),
            key_path: hvconsole_common::default_key_path(),
            hypervisor: HypervisorConfig::default(),
            relay: BridgeConfig::default(),
        }
    }
}

/// Hypervisor control API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Path prefix of the control API
    pub api_prefix: String,

    /// Bound on the authentication round trip
    pub auth_timeout_secs: u64,

    /// Bound on the console ticket round trip
    pub ticket_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            api_prefix: "/api2/json".to_string(),
            auth_timeout_secs: 10,
            ticket_timeout_secs: 10,
        }
    }
}

impl HypervisorConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn ticket_timeout(&self) -> Duration {
        Duration::from_secs(self.ticket_timeout_secs)
    }
}

/// Relay bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Setup window for the upstream console connection to open
    pub upstream_open_timeout_secs: u64,

    /// Bound on closing the peer connection during teardown
    pub close_timeout_secs: u64,

    /// Largest websocket message accepted on either connection
    pub max_message_size: usize,

    /// Client data held while the upstream console is still opening
    pub max_pending_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            upstream_open_timeout_secs: 10,
            close_timeout_secs: 5,
            max_message_size: 16 * 1024 * 1024,
            max_pending_bytes: 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    pub fn upstream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_open_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `HVCONSOLE_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(listen) = non_empty("HVCONSOLE_LISTEN") {
            self.listen = listen;
        }
        if let Some(path) = non_empty("HVCONSOLE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty("HVCONSOLE_KEY_PATH") {
            self.key_path = PathBuf::from(path);
        }
    }

    /// Reject configurations the relay cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hypervisor.api_prefix.trim().is_empty() {
            anyhow::bail!("hypervisor.api_prefix must not be empty");
        }
        if !self.hypervisor.api_prefix.starts_with('/') {
            anyhow::bail!("hypervisor.api_prefix must start with '/'");
        }
        if self.hypervisor.auth_timeout_secs == 0 || self.hypervisor.ticket_timeout_secs == 0 {
            anyhow::bail!("hypervisor timeouts must be greater than zero");
        }
        if self.relay.upstream_open_timeout_secs == 0 || self.relay.close_timeout_secs == 0 {
            anyhow::bail!("relay timeouts must be greater than zero");
        }
        if self.relay.max_message_size == 0 {
            anyhow::bail!("relay.max_message_size must be greater than zero");
        }
        if self.relay.max_pending_bytes == 0 {
            anyhow::bail!("relay.max_pending_bytes must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hypervisor.api_prefix, "/api2/json");
        assert_eq!(config.relay.upstream_open_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"

            [hypervisor]
            auth_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.hypervisor.auth_timeout_secs, 3);
        assert_eq!(config.hypervisor.ticket_timeout_secs, 10);
        assert_eq!(config.relay.close_timeout_secs, 5);
        assert_eq!(config.relay.max_pending_bytes, 1024 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HVCONSOLE_LISTEN", "0.0.0.0:7000"),
            ("HVCONSOLE_DB_PATH", "/var/lib/hvconsole/state.db"),
            ("HVCONSOLE_KEY_PATH", " "),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        let default_key = config.key_path.clone();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listen, "0.0.0.0:7000");
        assert_eq!(config.db_path, PathBuf::from("/var/lib/hvconsole/state.db"));
        assert_eq!(config.key_path, default_key);
    }

    #[test]
    fn test_validation_rejects_zero_timeouts() {
        let mut config = RelayConfig::default();
        config.relay.upstream_open_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.hypervisor.api_prefix = "api2/json".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.relay.max_pending_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = RelayConfig::default();
        config.relay.max_message_size = 1024;
        config.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded.relay.max_message_size, 1024);

        let missing = RelayConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(missing.listen, "127.0.0.1:8090");
    }
}
