//! Node Commands

use anyhow::Result;
use clap::Subcommand;
use hvconsole_common::{NodeProfile, SqliteNodeRegistry, DEFAULT_API_PORT, DEFAULT_REALM};
use serde::Serialize;

use super::Context;
use crate::output::{print_info, print_list, print_success, print_warning, TableDisplay};

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Register or update a hypervisor node
    Add {
        /// Node name, as used in console requests
        name: String,

        /// Control API host name or address
        #[arg(long)]
        host: String,

        /// Control API port
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        port: u16,

        /// Control API user
        #[arg(short, long)]
        username: String,

        /// Authentication realm
        #[arg(long, default_value = DEFAULT_REALM)]
        realm: String,

        /// Credential store entry holding the password
        #[arg(short, long)]
        credential: String,

        /// Skip TLS certificate verification for this node
        #[arg(long)]
        insecure: bool,

        /// Use http/ws instead of https/wss
        #[arg(long)]
        plain_http: bool,
    },

    /// List registered nodes
    List,

    /// Remove a node
    Remove {
        /// Node name
        name: String,
    },
}

/// Node display wrapper for serialization
#[derive(Serialize)]
pub struct NodeDisplay {
    pub name: String,
    pub endpoint: String,
    pub login: String,
    pub credential: String,
    pub tls: String,
}

impl From<NodeProfile> for NodeDisplay {
    fn from(node: NodeProfile) -> Self {
        let tls = match (node.use_tls, node.verify_tls) {
            (false, _) => "off",
            (true, true) => "verified",
            (true, false) => "unverified",
        };

        Self {
            endpoint: node.authority(),
            login: node.login(),
            name: node.name,
            credential: node.credential_ref,
            tls: tls.to_string(),
        }
    }
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Endpoint", "Login", "Credential", "TLS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.endpoint.clone(),
            self.login.clone(),
            self.credential.clone(),
            self.tls.clone(),
        ]
    }
}

pub async fn execute(cmd: NodeCommands, ctx: &Context) -> Result<()> {
    let registry = SqliteNodeRegistry::new(ctx.open_db()?);

    match cmd {
        NodeCommands::Add {
            name,
            host,
            port,
            username,
            realm,
            credential,
            insecure,
            plain_http,
        } => {
            let mut node = NodeProfile::new(name, host, username, credential);
            node.port = port;
            node.realm = realm;
            node.verify_tls = !insecure;
            node.use_tls = !plain_http;
            registry.upsert(&node)?;

            if plain_http {
                print_warning(&format!("{} will be contacted without TLS", node.name));
            } else if insecure {
                print_warning(&format!("TLS certificates of {} will not be verified", node.name));
            }
            if !credential_stored(ctx, &node.credential_ref).await {
                print_info(&format!(
                    "Store the password with `hvconsole credential set {}`",
                    node.credential_ref
                ));
            }
            print_success(&format!("Node {} registered at {}", node.name, node.authority()));
        }

        NodeCommands::List => {
            let nodes: Vec<NodeDisplay> = registry.all()?.into_iter().map(NodeDisplay::from).collect();
            print_list(&nodes, ctx.format);
        }

        NodeCommands::Remove { name } => {
            if registry.remove(&name)? {
                print_success(&format!("Node {} removed", name));
            } else {
                anyhow::bail!("node {} is not registered", name);
            }
        }
    }

    Ok(())
}

async fn credential_stored(ctx: &Context, name: &str) -> bool {
    match ctx.credential_store().await {
        Ok(store) => store.contains(name).unwrap_or(false),
        Err(_) => false,
    }
}
