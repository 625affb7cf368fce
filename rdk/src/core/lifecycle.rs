//! Per-unit deployment state machine.
//!
//! ```text
//! NotDeployed -> Deploying -> {Deployed, Failed, RolledBack}
//! Deployed -(unchanged)-> Deployed
//! Deployed -> Updating -> {Deployed, Failed, RolledBack}
//! any -> Destroying -> {NotDeployed, Failed}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::status::{RemoteStackStatus, StackOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    NotDeployed,
    Deploying,
    Deployed,
    Updating,
    Destroying,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEvent {
    BeginCreate,
    BeginUpdate,
    BeginDestroy,
    /// The remote API had nothing to update.
    NoChanges,
    Finished(StackOutcome),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: UnitState,
    pub event: UnitEvent,
}

impl UnitState {
    /// Starting state derived from a describe call.
    pub fn from_remote(status: Option<&RemoteStackStatus>) -> Self {
        match status {
            None => UnitState::NotDeployed,
            Some(status) if status.is_deleted() => UnitState::NotDeployed,
            Some(status) => match status.outcome() {
                Some(StackOutcome::Failed) => UnitState::Failed,
                Some(StackOutcome::RolledBack) => UnitState::RolledBack,
                _ => UnitState::Deployed,
            },
        }
    }

    pub fn transition(self, event: UnitEvent) -> Result<UnitState, TransitionError> {
        use UnitState::{Deployed, Deploying, Destroying, Failed, NotDeployed, RolledBack, Updating};

        let next = match (self, event) {
            (NotDeployed, UnitEvent::BeginCreate) => Deploying,
            (Deployed | Failed | RolledBack, UnitEvent::BeginUpdate) => Updating,
            (_, UnitEvent::BeginDestroy) => Destroying,
            (Updating, UnitEvent::NoChanges) => Deployed,
            (Deploying | Updating, UnitEvent::Finished(outcome)) => match outcome {
                StackOutcome::Succeeded => Deployed,
                StackOutcome::RolledBack => RolledBack,
                StackOutcome::Failed => Failed,
            },
            (Destroying, UnitEvent::Finished(StackOutcome::Succeeded)) => NotDeployed,
            (Destroying, UnitEvent::Finished(_)) => Failed,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Whether the unit ended somewhere an operator needs to look at.
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitState::Failed | UnitState::RolledBack)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitState::NotDeployed => "not deployed",
            UnitState::Deploying => "deploying",
            UnitState::Deployed => "deployed",
            UnitState::Updating => "updating",
            UnitState::Destroying => "destroying",
            UnitState::Failed => "failed",
            UnitState::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}
