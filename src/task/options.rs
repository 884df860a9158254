//! Call-time task options.
//!
//! Options are folded in order over a set of defaults. Each option is a pure
//! replacement of one field, so when the same option appears twice the later
//! one wins.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default retry budget for tasks enqueued without `MaxRetry`.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Queue used when no `Queue` option is given.
pub const DEFAULT_QUEUE: &str = "default";

/// One option passed to `enqueue` or `schedule`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOption {
    /// Retry budget; negative values are clamped to zero.
    MaxRetry(i32),
    /// Queue name; case-insensitive.
    Queue(String),
    /// Per-attempt execution limit; zero means unbounded.
    Timeout(Duration),
    /// Absolute time after which the task must not run.
    Deadline(DateTime<Utc>),
    /// Reject duplicates of this task (same queue, type, and payload) for this long.
    Unique(Duration),
    /// Keep the task in the completed collection for this long after success.
    Retention(Duration),
    /// Use a caller-chosen task ID instead of a generated one.
    TaskId(String),
}

/// The result of folding a list of [`TaskOption`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub max_retry: u32,
    pub queue: String,
    pub timeout: Duration,
    pub deadline: Option<DateTime<Utc>>,
    pub unique_ttl: Option<Duration>,
    pub retention: Duration,
    pub task_id: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::with_max_retry(DEFAULT_MAX_RETRY)
    }
}

impl TaskOptions {
    /// Defaults with a custom retry budget.
    pub fn with_max_retry(max_retry: u32) -> Self {
        Self {
            max_retry,
            queue: DEFAULT_QUEUE.to_string(),
            timeout: Duration::ZERO,
            deadline: None,
            unique_ttl: None,
            retention: Duration::ZERO,
            task_id: None,
        }
    }

    /// Returns these options with `option` applied.
    pub fn apply(mut self, option: &TaskOption) -> Self {
        match option {
            TaskOption::MaxRetry(n) => self.max_retry = (*n).max(0) as u32,
            TaskOption::Queue(name) => self.queue = normalize_queue_name(name),
            TaskOption::Timeout(timeout) => self.timeout = *timeout,
            TaskOption::Deadline(deadline) => self.deadline = Some(*deadline),
            TaskOption::Unique(ttl) => self.unique_ttl = Some(*ttl),
            TaskOption::Retention(retention) => self.retention = *retention,
            TaskOption::TaskId(id) => self.task_id = Some(id.clone()),
        }
        self
    }

    /// Folds `options` over `defaults` in order.
    pub fn compose(defaults: TaskOptions, options: &[TaskOption]) -> Self {
        options.iter().fold(defaults, Self::apply)
    }
}

/// Normalizes a queue name: surrounding whitespace removed, lower-cased.
pub fn normalize_queue_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = TaskOptions::default();

        assert_eq!(opts.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(opts.queue, "default");
        assert_eq!(opts.timeout, Duration::ZERO);
        assert!(opts.deadline.is_none());
        assert!(opts.unique_ttl.is_none());
        assert_eq!(opts.retention, Duration::ZERO);
        assert!(opts.task_id.is_none());
    }

    #[test]
    fn test_max_retry_clamped() {
        let opts = TaskOptions::compose(TaskOptions::default(), &[TaskOption::MaxRetry(-2)]);
        assert_eq!(opts.max_retry, 0);

        let opts = TaskOptions::compose(TaskOptions::default(), &[TaskOption::MaxRetry(3)]);
        assert_eq!(opts.max_retry, 3);
    }

    #[test]
    fn test_last_option_wins() {
        let opts = TaskOptions::compose(
            TaskOptions::default(),
            &[
                TaskOption::MaxRetry(2),
                TaskOption::Queue("low".to_string()),
                TaskOption::MaxRetry(10),
                TaskOption::Queue("critical".to_string()),
            ],
        );

        assert_eq!(opts.max_retry, 10);
        assert_eq!(opts.queue, "critical");
    }

    #[test]
    fn test_queue_is_case_insensitive() {
        let opts = TaskOptions::compose(
            TaskOptions::default(),
            &[TaskOption::Queue("  HIGH ".to_string())],
        );
        assert_eq!(opts.queue, "high");
    }

    #[test]
    fn test_custom_default_retry() {
        let opts = TaskOptions::compose(
            TaskOptions::with_max_retry(5),
            &[TaskOption::Timeout(Duration::from_secs(20))],
        );

        assert_eq!(opts.max_retry, 5);
        assert_eq!(opts.timeout, Duration::from_secs(20));
    }
}
