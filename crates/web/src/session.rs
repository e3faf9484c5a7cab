//! Relay session lifecycle

use chrono::{DateTime, Utc};
use hvconsole_common::{ConsoleTarget, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a console relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Init,
    Authenticating,
    TicketIssued,
    Upgrading,
    ConnectingUpstream,
    Relaying,
    Closed,
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Init => "init",
            RelayState::Authenticating => "authenticating",
            RelayState::TicketIssued => "ticket_issued",
            RelayState::Upgrading => "upgrading",
            RelayState::ConnectingUpstream => "connecting_upstream",
            RelayState::Relaying => "relaying",
            RelayState::Closed => "closed",
            RelayState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Closed | RelayState::Failed)
    }

    /// The only forward step out of this state, if any
    fn successor(&self) -> Option<RelayState> {
        match self {
            RelayState::Init => Some(RelayState::Authenticating),
            RelayState::Authenticating => Some(RelayState::TicketIssued),
            RelayState::TicketIssued => Some(RelayState::Upgrading),
            RelayState::Upgrading => Some(RelayState::ConnectingUpstream),
            RelayState::ConnectingUpstream => Some(RelayState::Relaying),
            RelayState::Relaying => Some(RelayState::Closed),
            RelayState::Closed | RelayState::Failed => None,
        }
    }

    /// Check if a transition is allowed
    pub fn can_transition_to(&self, next: RelayState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RelayState::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client's console relay, from request to teardown
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub id: Uuid,
    pub target: ConsoleTarget,
    pub created_at: DateTime<Utc>,
    state: RelayState,
}

impl RelaySession {
    pub fn new(target: ConsoleTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            created_at: Utc::now(),
            state: RelayState::Init,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Move to `next`, rejecting anything but the forward step or failure
    pub fn transition(&mut self, next: RelayState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            warn!(
                session = %self.id,
                "Rejected relay state transition {} -> {}",
                self.state,
                next
            );
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        debug!(session = %self.id, "Relay state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark the session failed unless it already ended
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.transition(RelayState::Failed);
        }
    }
}
