//! HTTP server for the console relay
//!
//! Routes:
//! - `GET /api/console?node=&resourceId=&resourceType=` websocket console
//! - `GET /api/nodes` registered nodes for the console picker
//! - `GET /api/health`

use crate::config::RelayConfig;
use crate::console::{ConsoleError, ConsoleQuery, ConsoleService, PreparedConsole};
use crate::hypervisor::{Hypervisor, HttpHypervisor};
use crate::relay::RelayBridge;
use crate::session::RelayState;
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hvconsole_common::{CredentialKey, CredentialStore, Database, NodeRegistry, SqliteNodeRegistry};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state for all handlers
pub struct WebServerState {
    pub console: ConsoleService,
    pub bridge: RelayBridge,
    pub registry: Arc<dyn NodeRegistry>,
}

/// Console relay web server
pub struct WebServer {
    state: Arc<WebServerState>,
}

impl WebServer {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        credentials: CredentialStore,
        hypervisor: Arc<dyn Hypervisor>,
        bridge: RelayBridge,
    ) -> Self {
        let console = ConsoleService::new(registry.clone(), credentials, hypervisor);
        Self {
            state: Arc::new(WebServerState {
                console,
                bridge,
                registry,
            }),
        }
    }

    /// Wire the production collaborators from configuration
    pub fn from_config(config: &RelayConfig, key: CredentialKey) -> anyhow::Result<Self> {
        let db = Database::open(&config.db_path)?;
        let registry: Arc<dyn NodeRegistry> = Arc::new(SqliteNodeRegistry::new(db.clone()));
        let credentials = CredentialStore::new(db, key);
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(HttpHypervisor::new(config.hypervisor.clone()));
        let bridge = RelayBridge::from_config(&config.relay);

        Ok(Self::new(registry, credentials, hypervisor, bridge))
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/nodes", get(nodes_handler))
            .route("/api/console", get(console_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Console relay listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Console relay stopped");
        Ok(())
    }
}

/// Serve the relay described by `config`
pub async fn serve(config: RelayConfig, key: CredentialKey) -> anyhow::Result<()> {
    let addr: SocketAddr = config.listen.parse()?;
    let server = WebServer::from_config(&config, key)?;
    server.serve(addr).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "hvconsole-web",
        "version": hvconsole_common::VERSION,
    }))
}

#[derive(Serialize)]
struct NodeSummary {
    name: String,
    host: String,
    port: u16,
}

async fn nodes_handler(State(state): State<Arc<WebServerState>>) -> Response {
    match state.registry.list().await {
        Ok(nodes) => {
            let nodes: Vec<NodeSummary> = nodes
                .into_iter()
                .map(|n| NodeSummary {
                    name: n.name,
                    host: n.host,
                    port: n.port,
                })
                .collect();
            Json(nodes).into_response()
        }
        Err(e) => ConsoleError::from(e).into_response(),
    }
}

async fn console_handler(
    State(state): State<Arc<WebServerState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    query: Result<Query<ConsoleQuery>, QueryRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return ConsoleError::UpgradeRequired(rejection.body_text()).into_response(),
    };

    let target = match query {
        Ok(Query(query)) => query.into_target(),
        Err(rejection) => Err(ConsoleError::Validation(rejection.body_text())),
    };
    let target = match target {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };

    let PreparedConsole {
        mut session,
        node,
        ticket,
    } = match state.console.prepare(target).await {
        Ok(prepared) => prepared,
        Err(e) => return e.into_response(),
    };

    if let Err(e) = session.transition(RelayState::Upgrading) {
        return ConsoleError::from(e).into_response();
    }

    let bridge = state.bridge.clone();
    let max_message_size = bridge.max_message_size();
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_failed_upgrade(|e| warn!("Client websocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            bridge.bridge_console(session, socket, node, ticket).await;
        })
}
