//! Error types for taskq operations.
//!
//! Defines error types for each subsystem:
//! - Broker operations against the backing store
//! - Client-side enqueue and schedule calls
//! - Task execution outcomes inside the processor
//! - Configuration loading and validation

use std::time::Duration;

use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A live uniqueness lock already exists for this key.
    #[error("Task already exists: uniqueness lock held for '{0}'")]
    DuplicateTask(String),

    /// A task with the same ID is already stored.
    #[error("Task ID '{0}' conflicts with an existing task")]
    TaskIdConflict(String),

    /// None of the requested queues had a ready task.
    #[error("No task available")]
    NoTaskAvailable,

    /// The task is not in the state the operation expects.
    #[error("Task '{id}' not found in {state} state of queue '{queue}'")]
    TaskNotFound {
        id: String,
        queue: String,
        state: &'static str,
    },

    /// The backing store could not be reached or rejected the command.
    #[error("Backing store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns whether the failed call may succeed if issued again unchanged.
    ///
    /// Only transport failures qualify. A store that answered with an
    /// error (script error, wrong type, bad reply) would answer the same
    /// way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Unavailable(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Errors returned by [`Client`](crate::client::Client) calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Task already exists: uniqueness lock held for '{0}'")]
    DuplicateTask(String),

    #[error("Task ID '{0}' conflicts with an existing task")]
    TaskIdConflict(String),

    /// The deadline had already passed; the task was archived instead of enqueued.
    #[error("Task deadline exceeded before enqueue")]
    DeadlineExceeded,

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Broker error: {0}")]
    Broker(BrokerError),
}

impl From<BrokerError> for ClientError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::DuplicateTask(key) => ClientError::DuplicateTask(key),
            BrokerError::TaskIdConflict(id) => ClientError::TaskIdConflict(id),
            other => ClientError::Broker(other),
        }
    }
}

/// Why a single execution attempt did not succeed.
///
/// These never leave the processor: each one is resolved into a
/// retry or an archive transition.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Handler failed: {0}")]
    HandlerExecutionFailed(String),

    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("No handler registered for task type '{0}'")]
    UnregisteredHandler(String),

    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler asked for the task to be archived without further attempts.
    #[error("Handler failed, retry skipped: {0}")]
    SkipRetry(String),
}

impl TaskError {
    /// Returns whether retrying the task could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TaskError::UnregisteredHandler(_) | TaskError::SkipRetry(_)
        )
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
