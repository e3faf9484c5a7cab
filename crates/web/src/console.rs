//! Console-open flow
//!
//! Validates the request, resolves the node, authenticates against its
//! control API and obtains a console ticket. Everything here runs before the
//! client connection is upgraded; any failure becomes a JSON error response.

use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::session::{RelaySession, RelayState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hvconsole_common::{
    validate_name, ConsoleTarget, ConsoleTicket, CredentialError, CredentialStore, NodeProfile,
    NodeRegistry, ResourceType,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Errors surfaced to the client before the websocket upgrade
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("{0}")]
    Validation(String),

    #[error("websocket upgrade required: {0}")]
    UpgradeRequired(String),

    #[error("node '{0}' is not registered")]
    NodeNotFound(String),

    /// Detail is logged, never returned
    #[error("credential unavailable")]
    CredentialUnavailable(#[source] CredentialError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConsoleError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsoleError::Validation(_) => "validation_error",
            ConsoleError::UpgradeRequired(_) => "upgrade_required",
            ConsoleError::NodeNotFound(_) => "not_found",
            ConsoleError::CredentialUnavailable(_) => "credential_unavailable",
            ConsoleError::Hypervisor(e) => e.kind(),
            ConsoleError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ConsoleError::Validation(_) | ConsoleError::UpgradeRequired(_) => StatusCode::BAD_REQUEST,
            ConsoleError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ConsoleError::CredentialUnavailable(_) | ConsoleError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ConsoleError::Hypervisor(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Status code returned by the hypervisor, if any
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ConsoleError::Hypervisor(e) => e.status(),
            _ => None,
        }
    }
}

impl From<hvconsole_common::Error> for ConsoleError {
    fn from(e: hvconsole_common::Error) -> Self {
        match e {
            hvconsole_common::Error::Validation(msg) => ConsoleError::Validation(msg),
            other => ConsoleError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "status": self.upstream_status(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Query string of a console request
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConsoleQuery {
    pub node: Option<String>,
    #[serde(rename = "resourceId", alias = "resource_id")]
    pub resource_id: Option<String>,
    #[serde(rename = "resourceType", alias = "resource_type")]
    pub resource_type: Option<String>,
}

impl ConsoleQuery {
    /// Validate into the console target, without touching any collaborator
    pub fn into_target(self) -> Result<ConsoleTarget, ConsoleError> {
        let missing = |name: &str| ConsoleError::Validation(format!("missing required parameter '{}'", name));

        let node = self.node.filter(|n| !n.is_empty()).ok_or_else(|| missing("node"))?;
        validate_name("node", &node)?;

        let resource_id = self
            .resource_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| missing("resourceId"))?;
        let resource_id: u64 = resource_id.parse().map_err(|_| {
            ConsoleError::Validation(format!("resourceId must be a non-negative integer, got '{}'", resource_id))
        })?;

        let resource_type: ResourceType = self
            .resource_type
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing("resourceType"))?
            .parse()?;

        Ok(ConsoleTarget::new(node, resource_id, resource_type))
    }
}

/// A console ready to be bridged once the client upgrade completes
#[derive(Debug)]
pub struct PreparedConsole {
    pub session: RelaySession,
    pub node: NodeProfile,
    pub ticket: ConsoleTicket,
}

/// Runs the pre-upgrade handshake for console requests
#[derive(Clone)]
pub struct ConsoleService {
    registry: Arc<dyn NodeRegistry>,
    credentials: CredentialStore,
    hypervisor: Arc<dyn Hypervisor>,
}

impl ConsoleService {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        credentials: CredentialStore,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            registry,
            credentials,
            hypervisor,
        }
    }

    /// Resolve, authenticate and obtain a console ticket for `target`
    pub async fn prepare(&self, target: ConsoleTarget) -> Result<PreparedConsole, ConsoleError> {
        let mut session = RelaySession::new(target);
        match self.handshake(&mut session).await {
            Ok((node, ticket)) => {
                info!(session = %session.id, "Console ticket ready for {}", session.target);
                Ok(PreparedConsole { session, node, ticket })
            }
            Err(e) => {
                session.fail();
                warn!(session = %session.id, "Console request for {} failed: {}", session.target, e);
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        session: &mut RelaySession,
    ) -> Result<(NodeProfile, ConsoleTicket), ConsoleError> {
        let target = session.target.clone();
        let node = self
            .registry
            .lookup(&target.node)
            .await?
            .ok_or_else(|| ConsoleError::NodeNotFound(target.node.clone()))?;

        session.transition(RelayState::Authenticating)?;
        let session_ticket = {
            let password = self.load_credential(&node).await?;
            self.hypervisor.authenticate(&node, &password).await?
        };

        let ticket = self
            .hypervisor
            .issue_console_ticket(&node, session_ticket, target)
            .await?;
        session.transition(RelayState::TicketIssued)?;

        Ok((node, ticket))
    }

    /// Decrypt the node's credential for a single authentication attempt
    async fn load_credential(&self, node: &NodeProfile) -> Result<Zeroizing<String>, ConsoleError> {
        let store = self.credentials.clone();
        let name = node.credential_ref.clone();
        let result = tokio::task::spawn_blocking(move || store.retrieve(&name))
            .await
            .map_err(|e| ConsoleError::Internal(format!("credential task failed: {}", e)))?;

        result.map_err(|e| {
            warn!(node = %node.name, "Credential '{}' unavailable: {}", node.credential_ref, e);
            ConsoleError::CredentialUnavailable(e)
        })
    }
}
