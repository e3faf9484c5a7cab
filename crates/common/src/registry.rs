//! Node registry: resolves node names to connection profiles

use crate::db::Database;
use crate::types::NodeProfile;
use crate::Result;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

/// Read-only view of registered nodes used by the console relay
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Resolve a node name. `Ok(None)` means the node is not registered.
    async fn lookup(&self, name: &str) -> Result<Option<NodeProfile>>;

    /// All registered nodes, sorted by name
    async fn list(&self) -> Result<Vec<NodeProfile>>;
}

/// Node registry persisted in the shared SQLite database
#[derive(Clone)]
pub struct SqliteNodeRegistry {
    db: Database,
}

const NODE_COLUMNS: &str =
    "name, host, port, username, realm, credential_ref, verify_tls, use_tls, created_at, updated_at";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeProfile> {
    Ok(NodeProfile {
        name: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        realm: row.get(4)?,
        credential_ref: row.get(5)?,
        verify_tls: row.get(6)?,
        use_tls: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl SqliteNodeRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a node profile
    pub fn upsert(&self, node: &NodeProfile) -> Result<()> {
        node.validate()?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO nodes (name, host, port, username, realm, credential_ref, verify_tls, use_tls, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                realm = excluded.realm,
                credential_ref = excluded.credential_ref,
                verify_tls = excluded.verify_tls,
                use_tls = excluded.use_tls,
                updated_at = excluded.updated_at",
            params![
                node.name,
                node.host,
                node.port,
                node.username,
                node.realm,
                node.credential_ref,
                node.verify_tls,
                node.use_tls,
                now,
            ],
        )?;

        debug!("Registered node {} at {}", node.name, node.authority());
        Ok(())
    }

    /// Remove a node. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute("DELETE FROM nodes WHERE name = ?1", params![name])?;
        if rows > 0 {
            debug!("Removed node {}", name);
        }
        Ok(rows > 0)
    }

    pub fn get(&self, name: &str) -> Result<Option<NodeProfile>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE name = ?1", NODE_COLUMNS),
                params![name],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub fn all(&self) -> Result<Vec<NodeProfile>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes ORDER BY name", NODE_COLUMNS))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }
}

#[async_trait]
impl NodeRegistry for SqliteNodeRegistry {
    async fn lookup(&self, name: &str) -> Result<Option<NodeProfile>> {
        let registry = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || registry.get(&name)).await?
    }

    async fn list(&self) -> Result<Vec<NodeProfile>> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.all()).await?
    }
}
