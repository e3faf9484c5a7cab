//! Hypervisor control API client
//!
//! Exchanges node credentials for a session ticket, then the session ticket
//! for a one-time console ticket scoped to a single guest.

use crate::config::HypervisorConfig;
use async_trait::async_trait;
use hvconsole_common::{ConsoleTarget, ConsoleTicket, NodeProfile, SessionTicket};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failures talking to the hypervisor control API.
///
/// None of these carry the submitted credentials or issued tickets.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { status: Option<u16>, reason: String },

    #[error("resource not found: {target}")]
    ResourceNotFound { status: Option<u16>, target: String },

    #[error("console ticket issuance failed: {reason}")]
    TicketIssuanceFailed { status: Option<u16>, reason: String },
}

impl HypervisorError {
    /// Upstream HTTP status, when one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            HypervisorError::AuthenticationFailed { status, .. }
            | HypervisorError::ResourceNotFound { status, .. }
            | HypervisorError::TicketIssuanceFailed { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HypervisorError::AuthenticationFailed { .. } => "authentication_failed",
            HypervisorError::ResourceNotFound { .. } => "resource_not_found",
            HypervisorError::TicketIssuanceFailed { .. } => "ticket_issuance_failed",
        }
    }
}

/// Hypervisor control-plane operations used to open a console
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Exchange credentials for a session ticket and anti-forgery token
    async fn authenticate(
        &self,
        node: &NodeProfile,
        password: &str,
    ) -> Result<SessionTicket, HypervisorError>;

    /// Exchange a session ticket for a console ticket scoped to `target`
    async fn issue_console_ticket(
        &self,
        node: &NodeProfile,
        session: SessionTicket,
        target: ConsoleTarget,
    ) -> Result<ConsoleTicket, HypervisorError>;
}

/// Hypervisor control API over HTTPS
#[derive(Debug, Clone)]
pub struct HttpHypervisor {
    config: HypervisorConfig,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct AuthData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct ConsoleData {
    port: PortValue,
    ticket: String,
}

/// The API reports the console port either as a number or a numeric string
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn parse(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl HttpHypervisor {
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }

    /// Base URL of the node's control API
    pub fn api_base(&self, node: &NodeProfile) -> String {
        format!(
            "{}://{}{}",
            node.http_scheme(),
            node.authority(),
            self.config.api_prefix.trim_end_matches('/')
        )
    }

    /// Fresh client honoring the node's TLS policy
    fn client(&self, node: &NodeProfile) -> reqwest::Result<reqwest::Client> {
        if node.use_tls && !node.verify_tls {
            warn!(
                node = %node.name,
                "TLS certificate verification disabled for {}",
                node.authority()
            );
        }
        reqwest::Client::builder()
            .danger_accept_invalid_certs(!node.verify_tls)
            .build()
    }
}

async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

fn auth_failed(status: Option<u16>, reason: impl Into<String>) -> HypervisorError {
    HypervisorError::AuthenticationFailed {
        status,
        reason: reason.into(),
    }
}

fn ticket_failed(status: Option<u16>, reason: impl Into<String>) -> HypervisorError {
    HypervisorError::TicketIssuanceFailed {
        status,
        reason: reason.into(),
    }
}

/// Whether an error response means the guest does not exist
fn is_missing_resource(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::NOT_FOUND
        || (status.is_server_error() && body.contains("does not exist"))
}

#[async_trait]
impl Hypervisor for HttpHypervisor {
    async fn authenticate(
        &self,
        node: &NodeProfile,
        password: &str,
    ) -> Result<SessionTicket, HypervisorError> {
        let url = format!("{}/access/ticket", self.api_base(node));
        let login = node.login();
        debug!(node = %node.name, "Authenticating as {}", login);

        let request = async {
            let client = self
                .client(node)
                .map_err(|e| auth_failed(None, format!("client setup failed: {}", e)))?;

            let resp = client
                .post(&url)
                .form(&[("username", login.as_str()), ("password", password)])
                .send()
                .await
                .map_err(|e| auth_failed(None, format!("request failed: {}", e.without_url())))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(auth_failed(
                    Some(status.as_u16()),
                    format!("upstream returned {}", status),
                ));
            }

            let body: ApiResponse<AuthData> = resp
                .json()
                .await
                .map_err(|_| auth_failed(Some(status.as_u16()), "malformed authentication response"))?;

            let data = body
                .data
                .ok_or_else(|| auth_failed(Some(status.as_u16()), "authentication response carried no ticket"))?;

            Ok::<_, HypervisorError>(SessionTicket::new(data.ticket, data.csrf_token))
        };

        let limit = self.config.auth_timeout();
        let ticket = bounded(limit, request, || {
            auth_failed(None, format!("timed out after {}s", limit.as_secs()))
        })
        .await;

        match &ticket {
            Ok(_) => debug!(node = %node.name, "Authenticated"),
            Err(e) => warn!(node = %node.name, "{}", e),
        }
        ticket
    }

    async fn issue_console_ticket(
        &self,
        node: &NodeProfile,
        session: SessionTicket,
        target: ConsoleTarget,
    ) -> Result<ConsoleTicket, HypervisorError> {
        let url = format!(
            "{}/nodes/{}/{}/{}/vncproxy",
            self.api_base(node),
            target.node,
            target.resource_type.api_segment(),
            target.resource_id
        );
        debug!(node = %node.name, "Requesting console ticket for {}", target);

        let request = async {
            let client = self
                .client(node)
                .map_err(|e| ticket_failed(None, format!("client setup failed: {}", e)))?;

            let resp = client
                .post(&url)
                .header(reqwest::header::COOKIE, format!("PVEAuthCookie={}", session.ticket()))
                .header("CSRFPreventionToken", session.csrf_token())
                .form(&[("websocket", "1")])
                .send()
                .await
                .map_err(|e| ticket_failed(None, format!("request failed: {}", e.without_url())))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                if is_missing_resource(status, &body) {
                    return Err(HypervisorError::ResourceNotFound {
                        status: Some(status.as_u16()),
                        target: target.to_string(),
                    });
                }
                return Err(ticket_failed(
                    Some(status.as_u16()),
                    format!("upstream returned {}", status),
                ));
            }

            let body: ApiResponse<ConsoleData> = resp
                .json()
                .await
                .map_err(|_| ticket_failed(Some(status.as_u16()), "malformed console ticket response"))?;

            let data = body
                .data
                .ok_or_else(|| ticket_failed(Some(status.as_u16()), "console ticket response carried no data"))?;
            let port = data
                .port
                .parse()
                .ok_or_else(|| ticket_failed(Some(status.as_u16()), "console ticket response carried an invalid port"))?;

            Ok::<_, HypervisorError>(ConsoleTicket::new(port, data.ticket, target.clone()))
        };

        let limit = self.config.ticket_timeout();
        let ticket = bounded(limit, request, || {
            ticket_failed(None, format!("timed out after {}s", limit.as_secs()))
        })
        .await;

        // The session ticket is single use
        drop(session);

        match &ticket {
            Ok(t) => debug!(node = %node.name, "Console ticket issued for {} on port {}", target, t.port()),
            Err(e) => warn!(node = %node.name, "{}", e),
        }
        ticket
    }
}
