//! Core data model shared by the relay and the operator tooling

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Default control API port of a hypervisor node
pub const DEFAULT_API_PORT: u16 = 8006;

/// Default authentication realm
pub const DEFAULT_REALM: &str = "pam";

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}

/// Kind of guest whose console is being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Vm,
    Container,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Vm => "vm",
            ResourceType::Container => "container",
        }
    }

    /// Path segment used by the hypervisor control API
    pub fn api_segment(&self) -> &'static str {
        match self {
            ResourceType::Vm => "qemu",
            ResourceType::Container => "lxc",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vm" => Ok(ResourceType::Vm),
            "container" => Ok(ResourceType::Container),
            other => Err(Error::Validation(format!(
                "resourceType must be 'vm' or 'container', got '{}'",
                other
            ))),
        }
    }
}

/// Connection profile of a registered hypervisor node.
///
/// `credential_ref` names an entry in the credential store; the profile
/// itself never carries a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    pub credential_ref: String,
    /// Verify the node's TLS certificate. Disabling this is an explicit opt-in.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Speak https/wss to the node rather than http/ws
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl NodeProfile {
    /// Create a profile with default port, realm and a verified TLS policy
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_API_PORT,
            username: username.into(),
            realm: default_realm(),
            credential_ref: credential_ref.into(),
            verify_tls: true,
            use_tls: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Login name submitted to the control API (`user@realm`)
    pub fn login(&self) -> String {
        if self.realm.is_empty() || self.username.contains('@') {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.realm)
        }
    }

    pub fn http_scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.use_tls {
            "wss"
        } else {
            "ws"
        }
    }

    /// `host:port`, bracketing bare IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check that the profile is usable before it is persisted
    pub fn validate(&self) -> Result<()> {
        validate_name("node name", &self.name)?;
        if self.host.trim().is_empty() {
            return Err(Error::Validation("host must not be empty".to_string()));
        }
        if self.host.contains('/') || self.host.contains(char::is_whitespace) {
            return Err(Error::Validation(format!("invalid host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(Error::Validation("port must not be 0".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Validation("username must not be empty".to_string()));
        }
        validate_name("credential reference", &self.credential_ref)?;
        Ok(())
    }
}

/// Node names and credential names share the same character set
pub fn validate_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", what)));
    }
    if value.len() > 64 {
        return Err(Error::Validation(format!(
            "{} must be at most 64 characters",
            what
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::Validation(format!(
            "{} contains invalid character '{}'",
            what, c
        )));
    }
    Ok(())
}

/// The single guest console a ticket is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsoleTarget {
    pub node: String,
    pub resource_id: u64,
    pub resource_type: ResourceType,
}

impl ConsoleTarget {
    pub fn new(node: impl Into<String>, resource_id: u64, resource_type: ResourceType) -> Self {
        Self {
            node: node.into(),
            resource_id,
            resource_type,
        }
    }
}

impl fmt::Display for ConsoleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.resource_type, self.resource_id)
    }
}

/// Control-plane session issued by the hypervisor's authentication endpoint.
///
/// Consumed by value when requesting a console ticket. Not `Clone`, not
/// serializable, and redacted in `Debug` output.
pub struct SessionTicket {
    ticket: Zeroizing<String>,
    csrf_token: Zeroizing<String>,
    issued_at: DateTime<Utc>,
}

impl SessionTicket {
    pub fn new(ticket: String, csrf_token: String) -> Self {
        Self {
            ticket: Zeroizing::new(ticket),
            csrf_token: Zeroizing::new(csrf_token),
            issued_at: Utc::now(),
        }
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket")
            .field("ticket", &"<redacted>")
            .field("csrf_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// One-time console ticket scoped to exactly one target
pub struct ConsoleTicket {
    port: u16,
    ticket: Zeroizing<String>,
    issued_at: DateTime<Utc>,
    target: ConsoleTarget,
}

impl ConsoleTicket {
    pub fn new(port: u16, ticket: String, target: ConsoleTarget) -> Self {
        Self {
            port,
            ticket: Zeroizing::new(ticket),
            issued_at: Utc::now(),
            target,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn target(&self) -> &ConsoleTarget {
        &self.target
    }
}

impl fmt::Debug for ConsoleTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleTicket")
            .field("port", &self.port)
            .field("ticket", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("target", &self.target)
            .finish()
    }
}
