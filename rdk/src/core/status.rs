//! Classification of remote stack statuses.
//!
//! A status snapshot is never cached: every poll produces a fresh
//! [`RemoteStackStatus`] and the decision is recomputed from it.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";
pub const ROLLBACK_COMPLETE: &str = "ROLLBACK_COMPLETE";

/// Terminal classification of a remote stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackOutcome {
    Succeeded,
    RolledBack,
    Failed,
}

impl StackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StackOutcome::Succeeded)
    }
}

impl fmt::Display for StackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StackOutcome::Succeeded => "succeeded",
            StackOutcome::RolledBack => "rolled back",
            StackOutcome::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of one stack instance as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStackStatus {
    pub stack_name: String,
    pub status: String,
    pub status_reason: Option<String>,
}

impl RemoteStackStatus {
    pub fn new(stack_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            status: status.into(),
            status_reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status == DELETE_COMPLETE
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.contains("IN_PROGRESS")
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Terminal outcome, or `None` while an operation is still running.
    ///
    /// Precedence: in-progress, failed, rollback, complete. Cleanup phases
    /// such as `UPDATE_COMPLETE_CLEANUP_IN_PROGRESS` are still running.
    pub fn outcome(&self) -> Option<StackOutcome> {
        let status = self.status.as_str();
        if self.is_in_progress() {
            return None;
        }
        if status.contains("FAILED") {
            return Some(StackOutcome::Failed);
        }
        if status.contains(ROLLBACK_COMPLETE) {
            return Some(StackOutcome::RolledBack);
        }
        if status.contains("COMPLETE") {
            return Some(StackOutcome::Succeeded);
        }
        None
    }

    pub fn reason(&self) -> &str {
        self.status_reason.as_deref().unwrap_or("no reason reported")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(value: &str) -> RemoteStackStatus {
        RemoteStackStatus::new("Stack", value)
    }

    #[test]
    fn complete_statuses_succeed() {
        for value in ["CREATE_COMPLETE", "UPDATE_COMPLETE", "IMPORT_COMPLETE"] {
            assert_eq!(status(value).outcome(), Some(StackOutcome::Succeeded), "{value}");
        }
        assert!(status(DELETE_COMPLETE).is_terminal());
        assert!(status(DELETE_COMPLETE).is_deleted());
    }

    #[test]
    fn rollback_statuses_are_rollbacks() {
        assert_eq!(
            status("ROLLBACK_COMPLETE").outcome(),
            Some(StackOutcome::RolledBack)
        );
        assert_eq!(
            status("UPDATE_ROLLBACK_COMPLETE").outcome(),
            Some(StackOutcome::RolledBack)
        );
    }

    #[test]
    fn failed_wins_over_rollback() {
        assert_eq!(
            status("UPDATE_ROLLBACK_FAILED").outcome(),
            Some(StackOutcome::Failed)
        );
        assert_eq!(status("CREATE_FAILED").outcome(), Some(StackOutcome::Failed));
    }

    #[test]
    fn in_progress_is_never_terminal() {
        for value in [
            "CREATE_IN_PROGRESS",
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            "ROLLBACK_IN_PROGRESS",
            "REVIEW_IN_PROGRESS",
        ] {
            assert!(!status(value).is_terminal(), "{value}");
        }
    }

    #[test]
    fn reason_falls_back_to_placeholder() {
        assert_eq!(status("CREATE_FAILED").reason(), "no reason reported");
        let with_reason = status("CREATE_FAILED").with_reason("Resource limit exceeded");
        assert_eq!(with_reason.reason(), "Resource limit exceeded");
    }
}
