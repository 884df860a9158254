//! Broker: the only component that touches the backing store.
//!
//! Every state-mutating operation is applied atomically: as a single Lua
//! script in [`RedisBroker`], or under one store-wide lock in
//! [`MemoryBroker`]. No reader ever observes a task half-way between two
//! collections.
//!
//! # Architecture
//!
//! ```text
//!   Client ──enqueue/schedule──► ┌──────────────┐ ◄──dequeue/done/retry/archive── Processor
//!                                │    Broker    │
//!   Monitor ──lease/forward────► └──────┬───────┘
//!                                       │
//!                                ┌──────▼───────┐
//!                                │ Redis / mem  │
//!                                └──────────────┘
//! ```

pub mod config;
pub mod keys;
pub mod memory;
pub mod redis;
mod scripts;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::task::TaskMessage;

pub use self::config::BrokerConfig;
pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;
pub use self::state::{failure_transition, FailureTransition, TaskState};

/// Tasks moved per forwarder or janitor script call.
pub(crate) const BATCH_SIZE: usize = 100;

/// A task handed to a worker by [`Broker::dequeue`].
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub message: TaskMessage,
    /// Token identifying this lease. Every later transition of the task
    /// must present it; a new dequeue of the same task issues a new one.
    pub lease_id: String,
    /// The lease expires at this time unless extended.
    pub lease_deadline: DateTime<Utc>,
}

/// A task as seen by a read-only listing.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    pub message: TaskMessage,
    /// Sort score of the entry: process-at for scheduled tasks, lease
    /// deadline for active ones, archival time for archived ones, retention
    /// expiry for completed ones, and `None` for pending tasks.
    pub score: Option<DateTime<Utc>>,
}

/// Liveness record written by each running processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub host: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub active_workers: usize,
    pub started_at: DateTime<Utc>,
}

/// Statistics about one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue: String,
    pub pending: usize,
    pub active: usize,
    pub scheduled: usize,
    pub archived: usize,
    pub completed: usize,
    /// Tasks that finished successfully since the queue was created.
    pub processed: u64,
    /// Failed attempts (retried or archived) since the queue was created.
    pub failed: u64,
}

impl QueueStats {
    /// Returns the number of tasks currently stored in any state.
    pub fn size(&self) -> usize {
        self.pending + self.active + self.scheduled + self.archived + self.completed
    }
}

/// Atomic state transitions over the backing store.
///
/// Operations that move a task out of `active` take the `lease_id` issued
/// by [`Broker::dequeue`]. They fail with [`BrokerError::TaskNotFound`] and
/// change nothing when the task is no longer active under that lease, for
/// example because another instance recovered and re-dequeued it after
/// its lease expired.
#[async_trait]
pub trait Broker: Send + Sync {
    /// How long a dequeued task stays leased without renewal.
    fn lease_duration(&self) -> Duration;

    /// Inserts a new task into the pending list of its queue.
    ///
    /// With a `unique_ttl` and a `unique_key` on the message, the insertion
    /// is rejected with [`BrokerError::DuplicateTask`] while another task
    /// holds the same lock.
    async fn enqueue(
        &self,
        msg: &TaskMessage,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Inserts a new task into the scheduled set, to become pending at `process_at`.
    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Claims the oldest pending task from the first non-empty queue in
    /// `queues`, leasing it to `server_id`.
    ///
    /// Returns [`BrokerError::NoTaskAvailable`] if every queue is empty.
    async fn dequeue(&self, server_id: &str, queues: &[String]) -> Result<LeasedTask, BrokerError>;

    /// Marks an active task as successfully processed.
    async fn done(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError>;

    /// Moves an active task, already updated for its next attempt, to the
    /// scheduled set at `retry_at`. Callers normally use [`Broker::retry`].
    async fn schedule_retry(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError>;

    /// Records a failed attempt of an active task.
    ///
    /// The task is scheduled for `retry_at` with `retried + 1` while its
    /// retry budget lasts and its deadline has not passed; otherwise it is
    /// archived. Returns the transition that was applied.
    async fn retry(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        retry_at: DateTime<Utc>,
        error_msg: &str,
    ) -> Result<FailureTransition, BrokerError> {
        let now = Utc::now();
        match failure_transition(msg, true, now) {
            FailureTransition::Retry => {
                self.schedule_retry(&msg.for_retry(error_msg, now), lease_id, retry_at)
                    .await?;
                Ok(FailureTransition::Retry)
            }
            FailureTransition::Archive => {
                self.archive(msg, lease_id, error_msg).await?;
                Ok(FailureTransition::Archive)
            }
        }
    }

    /// Moves an active task to the archived set.
    async fn archive(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        error_msg: &str,
    ) -> Result<(), BrokerError>;

    /// Archives a task that was never stored, such as one whose deadline
    /// had already passed at enqueue time.
    async fn archive_new(&self, msg: &TaskMessage, error_msg: &str) -> Result<(), BrokerError>;

    /// Moves an active task back to the front of its pending list, storing
    /// `msg` as its new record.
    async fn requeue(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError>;

    /// Moves every active task leased by `server_id` back to the front of
    /// its pending list. Returns the number of tasks moved.
    async fn requeue_all(&self, server_id: &str) -> Result<usize, BrokerError>;

    /// Pushes the lease deadline of an active task to `deadline`.
    ///
    /// Returns `false` if the task is no longer held under `lease_id`.
    async fn extend_lease(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool, BrokerError>;

    /// Returns active tasks of every known queue whose lease deadline is
    /// before `cutoff`, together with the lease they are held under.
    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeasedTask>, BrokerError>;

    /// Moves scheduled tasks that are due into pending, in score order.
    /// Returns the number of tasks moved.
    async fn forward_scheduled(&self, queues: &[String]) -> Result<usize, BrokerError>;

    /// Deletes completed tasks whose retention has elapsed.
    async fn delete_expired_completed(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Writes the liveness record of a processor, valid for `ttl`.
    async fn write_server_state(&self, info: &ServerInfo, ttl: Duration)
        -> Result<(), BrokerError>;

    /// Removes the liveness record of a processor.
    async fn clear_server_state(&self, server_id: &str) -> Result<(), BrokerError>;

    /// Returns the liveness records that have not expired.
    async fn servers(&self) -> Result<Vec<ServerInfo>, BrokerError>;

    /// Returns every queue that has ever received a task.
    async fn queues(&self) -> Result<Vec<String>, BrokerError>;

    /// Returns statistics for one queue.
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;

    /// Lists the tasks of one queue in one state.
    ///
    /// Pending tasks are returned in dequeue order; the others in score order.
    async fn list(&self, queue: &str, state: TaskState) -> Result<Vec<TaskEntry>, BrokerError>;
}

/// Converts a time to a store score (Unix seconds).
pub(crate) fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

/// Converts a store score back to a time.
pub(crate) fn from_score(score: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(score, 0)
}

/// Returns a fresh lease token.
pub(crate) fn new_lease_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Adds a std duration to a time, saturating on overflow.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_roundtrip_truncates_to_seconds() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_000_000).expect("valid time");
        assert_eq!(score(at), 1_700_000_000);
        assert_eq!(
            from_score(score(at)),
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn test_add_duration_saturates() {
        let now = Utc::now();
        assert_eq!(
            add_duration(now, Duration::from_secs(30)),
            now + chrono::Duration::seconds(30)
        );
        assert_eq!(
            add_duration(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_queue_stats_size() {
        let stats = QueueStats {
            queue: "default".to_string(),
            pending: 10,
            active: 5,
            scheduled: 3,
            archived: 2,
            completed: 1,
            processed: 100,
            failed: 7,
        };

        assert_eq!(stats.size(), 21);
    }
}
