//! Producer-side API: turns tasks plus options into stored messages.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskq::client::Client;
//! use taskq::task::{Task, TaskOption};
//!
//! let client = Client::new(broker);
//! let task = Task::from_json("send_email", &email)?;
//!
//! let info = client
//!     .enqueue(&task, &[TaskOption::Queue("critical".into()), TaskOption::MaxRetry(5)])
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::broker::{Broker, TaskState};
use crate::config::parse_env_value;
use crate::error::{ClientError, ConfigError};
use crate::metrics::MetricsCollector;
use crate::task::{
    unique_key, Task, TaskInfo, TaskMessage, TaskOption, TaskOptions, DEFAULT_MAX_RETRY,
};

/// Shortest accepted uniqueness lock.
pub const MIN_UNIQUE_TTL: Duration = Duration::from_secs(1);

/// Error message stored on tasks archived because their deadline passed
/// before they were ever enqueued.
const DEADLINE_EXCEEDED: &str = "deadline exceeded before enqueue";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retry budget for tasks enqueued without `MaxRetry`.
    pub default_max_retry: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl ClientConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKQ_DEFAULT_MAX_RETRY`: Default retry budget (default: 25)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKQ_DEFAULT_MAX_RETRY") {
            config.default_max_retry = parse_env_value(&val, "TASKQ_DEFAULT_MAX_RETRY")?;
        }

        Ok(config)
    }

    pub fn with_default_max_retry(mut self, max_retry: u32) -> Self {
        self.default_max_retry = max_retry;
        self
    }
}

/// Enqueues and schedules tasks.
pub struct Client {
    broker: Arc<dyn Broker>,
    config: ClientConfig,
    metrics: MetricsCollector,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, ClientConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: ClientConfig) -> Self {
        Self {
            broker,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Stores `task` for immediate processing.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidTask` if the task or options are malformed
    /// - `ClientError::DuplicateTask` if a `Unique` lock for the same task is held
    /// - `ClientError::TaskIdConflict` if a `TaskId` is already in use
    /// - `ClientError::DeadlineExceeded` if the deadline already passed; the
    ///   task is archived instead
    pub async fn enqueue(&self, task: &Task, opts: &[TaskOption]) -> Result<TaskInfo, ClientError> {
        self.submit(task, None, opts).await
    }

    /// Stores `task` to become pending at `process_at`.
    ///
    /// A `process_at` that is not in the future enqueues immediately.
    /// Errors are those of [`Client::enqueue`].
    pub async fn schedule(
        &self,
        task: &Task,
        process_at: DateTime<Utc>,
        opts: &[TaskOption],
    ) -> Result<TaskInfo, ClientError> {
        self.submit(task, Some(process_at), opts).await
    }

    async fn submit(
        &self,
        task: &Task,
        process_at: Option<DateTime<Utc>>,
        opts: &[TaskOption],
    ) -> Result<TaskInfo, ClientError> {
        let options = TaskOptions::compose(
            TaskOptions::with_max_retry(self.config.default_max_retry),
            opts,
        );
        let msg = build_message(task, &options)?;
        let now = Utc::now();

        if msg.deadline_passed(now) {
            warn!(task_id = %msg.id, queue = %msg.queue, "Task deadline already passed, archiving");
            self.broker.archive_new(&msg, DEADLINE_EXCEEDED).await?;
            return Err(ClientError::DeadlineExceeded);
        }

        let info = match process_at.filter(|at| *at > now) {
            Some(at) => {
                self.broker.schedule(&msg, at, options.unique_ttl).await?;
                self.metrics.record_enqueued(&msg.queue, "scheduled");
                TaskInfo::new(&msg, TaskState::Scheduled, at)
            }
            None => {
                self.broker.enqueue(&msg, options.unique_ttl).await?;
                self.metrics.record_enqueued(&msg.queue, "enqueued");
                TaskInfo::new(&msg, TaskState::Pending, now)
            }
        };

        info!(
            task_id = %info.id,
            queue = %info.queue,
            task_type = %info.type_name,
            state = %info.state,
            "Task accepted"
        );
        debug!(next_process_at = %info.next_process_at, max_retry = info.max_retry, "Task options");

        Ok(info)
    }
}

/// Builds the message for `task` under folded `options`.
fn build_message(task: &Task, options: &TaskOptions) -> Result<TaskMessage, ClientError> {
    if task.type_name().trim().is_empty() {
        return Err(ClientError::InvalidTask(
            "task type name cannot be empty".to_string(),
        ));
    }

    if options.queue.is_empty() {
        return Err(ClientError::InvalidTask(
            "queue name cannot be empty".to_string(),
        ));
    }

    if options.queue.contains(['{', '}']) {
        return Err(ClientError::InvalidTask(format!(
            "queue name '{}' cannot contain braces",
            options.queue
        )));
    }

    if let Some(ttl) = options.unique_ttl {
        if ttl < MIN_UNIQUE_TTL {
            return Err(ClientError::InvalidTask(
                "unique TTL must be at least 1 second".to_string(),
            ));
        }
    }

    let mut msg = TaskMessage::new(task);

    if let Some(id) = &options.task_id {
        if id.trim().is_empty() {
            return Err(ClientError::InvalidTask("task ID cannot be empty".to_string()));
        }
        msg.id = id.clone();
    }

    msg.queue = options.queue.clone();
    msg.max_retry = options.max_retry;
    msg.timeout = options.timeout;
    msg.deadline = options.deadline;
    msg.retention = options.retention;
    if options.unique_ttl.is_some() {
        msg.unique_key = Some(unique_key(task.type_name(), task.payload()));
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("send_email", b"{\"to\":\"customer@gmail.com\"}".to_vec())
    }

    #[test]
    fn test_build_message_applies_options() {
        let deadline = Utc::now() + chrono::Duration::hours(1);
        let options = TaskOptions::compose(
            TaskOptions::default(),
            &[
                TaskOption::Queue("Critical".to_string()),
                TaskOption::MaxRetry(3),
                TaskOption::Timeout(Duration::from_secs(20)),
                TaskOption::Deadline(deadline),
                TaskOption::Unique(Duration::from_secs(60)),
                TaskOption::TaskId("order-42".to_string()),
            ],
        );

        let msg = build_message(&task(), &options).expect("message should build");

        assert_eq!(msg.id, "order-42");
        assert_eq!(msg.queue, "critical");
        assert_eq!(msg.max_retry, 3);
        assert_eq!(msg.timeout, Duration::from_secs(20));
        assert_eq!(msg.deadline, Some(deadline));
        assert_eq!(
            msg.unique_key,
            Some(unique_key("send_email", task().payload()))
        );
    }

    #[test]
    fn test_build_message_rejects_invalid_input() {
        let defaults = TaskOptions::default();

        assert!(matches!(
            build_message(&Task::new(" ", Vec::new()), &defaults),
            Err(ClientError::InvalidTask(_))
        ));

        let options = TaskOptions::compose(
            TaskOptions::default(),
            &[TaskOption::Unique(Duration::from_millis(500))],
        );
        assert!(matches!(
            build_message(&task(), &options),
            Err(ClientError::InvalidTask(_))
        ));

        let options =
            TaskOptions::compose(TaskOptions::default(), &[TaskOption::Queue("  ".to_string())]);
        assert!(matches!(
            build_message(&task(), &options),
            Err(ClientError::InvalidTask(_))
        ));

        let options =
            TaskOptions::compose(TaskOptions::default(), &[TaskOption::Queue("a{b}".to_string())]);
        assert!(matches!(
            build_message(&task(), &options),
            Err(ClientError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_client_config() {
        assert_eq!(ClientConfig::default().default_max_retry, 25);
        assert_eq!(
            ClientConfig::default()
                .with_default_max_retry(3)
                .default_max_retry,
            3
        );
    }
}
