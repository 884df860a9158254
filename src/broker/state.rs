//! Queue state machine.
//!
//! ```text
//! pending   --dequeue-->                          active
//! scheduled --forward (score <= now)-->           pending
//! active    --done-->                             completed | purged
//! active    --retry (budget left)-->              scheduled
//! active    --retry (budget spent | deadline)-->  archived
//! active    --lease expired (budget left)-->      pending
//! active    --lease expired (budget spent)-->     archived
//! ```
//!
//! A task enters as `pending` or `scheduled`. The only way into `archived`
//! without passing through `active` is a deadline that already elapsed at
//! enqueue time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskMessage;

/// The collection a task currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Scheduled,
    Active,
    Archived,
    Completed,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Scheduled,
        TaskState::Active,
        TaskState::Archived,
        TaskState::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Archived => "archived",
            TaskState::Completed => "completed",
        }
    }

    /// Returns whether no further transition leaves this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Archived | TaskState::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failed attempt sends its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Back to `scheduled` (handler failure) or `pending` (lease expiry).
    Retry,
    /// Permanently to `archived`.
    Archive,
}

/// Decides the transition for a task whose attempt failed at `now`.
///
/// `retryable` is false for failures that another attempt cannot fix,
/// such as a missing handler.
pub fn failure_transition(
    msg: &TaskMessage,
    retryable: bool,
    now: DateTime<Utc>,
) -> FailureTransition {
    if retryable && msg.has_retry_budget() && !msg.deadline_passed(now) {
        FailureTransition::Retry
    } else {
        FailureTransition::Archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use chrono::Duration as ChronoDuration;

    fn message(max_retry: u32, retried: u32) -> TaskMessage {
        let mut msg = TaskMessage::new(&Task::new("send_email", b"{}".to_vec()));
        msg.max_retry = max_retry;
        msg.retried = retried;
        msg
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::Pending.to_string(), "pending");
        assert_eq!(TaskState::Scheduled.to_string(), "scheduled");
        assert_eq!(TaskState::Active.to_string(), "active");
        assert_eq!(TaskState::Archived.to_string(), "archived");
        assert_eq!(TaskState::Completed.to_string(), "completed");
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = TaskState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&TaskState::Archived, &TaskState::Completed]);
    }

    #[test]
    fn test_retry_while_budget_left() {
        let now = Utc::now();
        assert_eq!(
            failure_transition(&message(3, 0), true, now),
            FailureTransition::Retry
        );
        assert_eq!(
            failure_transition(&message(3, 2), true, now),
            FailureTransition::Retry
        );
    }

    #[test]
    fn test_archive_when_budget_spent() {
        let now = Utc::now();
        assert_eq!(
            failure_transition(&message(3, 3), true, now),
            FailureTransition::Archive
        );
        assert_eq!(
            failure_transition(&message(0, 0), true, now),
            FailureTransition::Archive
        );
    }

    #[test]
    fn test_archive_when_deadline_passed() {
        let now = Utc::now();
        let mut msg = message(10, 0);
        msg.deadline = Some(now - ChronoDuration::seconds(1));

        assert_eq!(
            failure_transition(&msg, true, now),
            FailureTransition::Archive
        );
    }

    #[test]
    fn test_archive_when_not_retryable() {
        assert_eq!(
            failure_transition(&message(10, 0), false, Utc::now()),
            FailureTransition::Archive
        );
    }

    #[test]
    fn test_retry_sequence_never_exceeds_budget() {
        let now = Utc::now();
        let mut msg = message(3, 0);
        let mut retries = 0;

        while failure_transition(&msg, true, now) == FailureTransition::Retry {
            msg = msg.for_retry("boom", now);
            retries += 1;
            assert!(msg.retried <= msg.max_retry);
        }

        assert_eq!(retries, 3);
        assert_eq!(msg.retried, 3);
    }
}
