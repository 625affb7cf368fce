//! Blocking poll loop that follows one stack until it is terminal.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::poll::PollPolicy;
use crate::core::status::{RemoteStackStatus, StackOutcome};
use crate::io::stack_api::{RemoteError, StackApi, list_all_stacks};

/// Pause between polls; injected so tests do not sleep.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("stack {stack_name} still {last_status} after {attempts} polls")]
    PollLimitExceeded {
        stack_name: String,
        attempts: u32,
        last_status: String,
    },
}

/// Terminal result of waiting on one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReport {
    pub stack_name: String,
    pub outcome: StackOutcome,
    /// The active instance at the final poll; `None` when no active instance
    /// exists (never created, or every instance deleted).
    pub status: Option<RemoteStackStatus>,
    pub polls: u32,
}

pub struct StackWaiter<'a, A: ?Sized, S: ?Sized> {
    api: &'a A,
    sleeper: &'a S,
    policy: PollPolicy,
}

impl<'a, A, S> StackWaiter<'a, A, S>
where
    A: StackApi + ?Sized,
    S: Sleeper + ?Sized,
{
    pub fn new(api: &'a A, sleeper: &'a S, policy: PollPolicy) -> Self {
        Self {
            api,
            sleeper,
            policy,
        }
    }

    /// Poll until the named stack is terminal.
    ///
    /// Every poll lists all pages; the status is never cached between polls.
    #[instrument(skip_all, fields(stack = %stack_name))]
    pub fn wait_for_terminal(&self, stack_name: &str) -> Result<WaitReport, WaitError> {
        let mut polls = 0;
        loop {
            polls += 1;
            let summaries = list_all_stacks(self.api)?;
            let active = summaries
                .into_iter()
                .filter(|summary| summary.stack_name == stack_name)
                .find(|summary| !summary.is_deleted());

            let Some(active) = active else {
                info!("no active instance; treating as complete");
                return Ok(WaitReport {
                    stack_name: stack_name.to_string(),
                    outcome: StackOutcome::Succeeded,
                    status: None,
                    polls,
                });
            };

            if let Some(outcome) = active.outcome() {
                match outcome {
                    StackOutcome::Failed => {
                        error!(status = %active.status, reason = %active.reason(), "stack operation failed");
                    }
                    StackOutcome::RolledBack => {
                        error!(status = %active.status, reason = %active.reason(), "stack rolled back");
                    }
                    StackOutcome::Succeeded => {
                        info!(status = %active.status, "stack operation complete");
                    }
                }
                return Ok(WaitReport {
                    stack_name: stack_name.to_string(),
                    outcome,
                    status: Some(active),
                    polls,
                });
            }

            if !self.policy.allows_another(polls) {
                warn!(status = %active.status, polls, "poll limit reached");
                return Err(WaitError::PollLimitExceeded {
                    stack_name: stack_name.to_string(),
                    attempts: polls,
                    last_status: active.status,
                });
            }
            info!(status = %active.status, "waiting for stack");
            debug!(interval = ?self.policy.interval, polls, "sleeping before next poll");
            self.sleeper.sleep(self.policy.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeStackApi, RecordingSleeper, capture_logs};

    fn waiter<'a>(
        api: &'a FakeStackApi,
        sleeper: &'a RecordingSleeper,
        max_attempts: Option<u32>,
    ) -> StackWaiter<'a, FakeStackApi, RecordingSleeper> {
        let policy = PollPolicy {
            interval: Duration::from_secs(5),
            max_attempts,
        };
        StackWaiter::new(api, sleeper, policy)
    }

    #[test]
    fn waits_through_in_progress_until_complete() {
        let api = FakeStackApi::new();
        api.set_timeline("Rule", &["CREATE_IN_PROGRESS", "CREATE_IN_PROGRESS", "CREATE_COMPLETE"]);
        let sleeper = RecordingSleeper::default();

        let report = waiter(&api, &sleeper, None)
            .wait_for_terminal("Rule")
            .expect("wait");

        assert_eq!(report.outcome, StackOutcome::Succeeded);
        assert_eq!(report.polls, 3);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn cleanup_in_progress_is_not_terminal() {
        let api = FakeStackApi::new();
        api.set_timeline(
            "Rule",
            &["UPDATE_COMPLETE_CLEANUP_IN_PROGRESS", "UPDATE_COMPLETE"],
        );
        let sleeper = RecordingSleeper::default();

        let report = waiter(&api, &sleeper, None)
            .wait_for_terminal("Rule")
            .expect("wait");

        assert_eq!(report.polls, 2);
        assert_eq!(report.outcome, StackOutcome::Succeeded);
    }

    #[test]
    fn rollback_logs_reason() {
        let api = FakeStackApi::new();
        api.set_timeline("X", &["CREATE_IN_PROGRESS", "ROLLBACK_COMPLETE"]);
        api.set_reason("X", "Resource creation cancelled");
        let sleeper = RecordingSleeper::default();

        let (result, logs) =
            capture_logs(|| waiter(&api, &sleeper, None).wait_for_terminal("X"));

        assert_eq!(result.expect("wait").outcome, StackOutcome::RolledBack);
        assert!(logs.contains("Resource creation cancelled"), "{logs}");
    }

    #[test]
    fn deleted_history_is_ignored() {
        let api = FakeStackApi::new();
        api.add_deleted("Rule");
        api.set_timeline("Rule", &["UPDATE_FAILED"]);
        let sleeper = RecordingSleeper::default();

        let report = waiter(&api, &sleeper, None)
            .wait_for_terminal("Rule")
            .expect("wait");

        assert_eq!(report.outcome, StackOutcome::Failed);
    }

    #[test]
    fn only_deleted_instances_is_success() {
        let api = FakeStackApi::new();
        api.add_deleted("Rule");
        let sleeper = RecordingSleeper::default();

        let report = waiter(&api, &sleeper, None)
            .wait_for_terminal("Rule")
            .expect("wait");

        assert_eq!(report.outcome, StackOutcome::Succeeded);
        assert_eq!(report.status, None);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn finds_instance_on_last_page() {
        let api = FakeStackApi::new().with_page_size(2);
        for name in ["A", "B", "C", "D"] {
            api.set_timeline(name, &["CREATE_COMPLETE"]);
        }
        api.set_timeline("Target", &["CREATE_FAILED"]);
        let sleeper = RecordingSleeper::default();

        let report = waiter(&api, &sleeper, None)
            .wait_for_terminal("Target")
            .expect("wait");

        assert_eq!(report.outcome, StackOutcome::Failed);
        assert_eq!(api.list_calls(), 3);
    }

    #[test]
    fn poll_limit_is_enforced() {
        let api = FakeStackApi::new();
        api.set_timeline("Rule", &["CREATE_IN_PROGRESS"]);
        let sleeper = RecordingSleeper::default();

        let err = waiter(&api, &sleeper, Some(3))
            .wait_for_terminal("Rule")
            .unwrap_err();

        assert!(matches!(err, WaitError::PollLimitExceeded { attempts: 3, .. }), "{err}");
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn remote_errors_propagate() {
        let api = FakeStackApi::new();
        api.set_unavailable(true);
        let sleeper = RecordingSleeper::default();

        let err = waiter(&api, &sleeper, None)
            .wait_for_terminal("Rule")
            .unwrap_err();

        assert!(matches!(err, WaitError::Remote(RemoteError::Unavailable(_))));
    }
}
