//! hvconsole Relay Server
//!
//! Bridges browser websockets to hypervisor console websockets after
//! authenticating against the node's control API.

pub mod config;
pub mod console;
pub mod frame;
pub mod hypervisor;
pub mod relay;
pub mod server;
pub mod session;
pub mod tls;

pub use config::RelayConfig;
pub use console::{ConsoleError, ConsoleQuery, ConsoleService, PreparedConsole};
pub use hypervisor::{Hypervisor, HypervisorError, HttpHypervisor};
pub use relay::{RelayBridge, RelayError, RelaySummary};
pub use server::WebServer;
pub use session::{RelaySession, RelayState};
