//! Task and task message definitions.
//!
//! - `Task`: what a producer hands to the client (type + payload)
//! - `TaskMessage`: the stored record for one task instance
//! - `TaskInfo`: summary returned to producers after enqueue

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::options::{DEFAULT_MAX_RETRY, DEFAULT_QUEUE};
use crate::broker::TaskState;

/// A unit of work: the handler type name plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    type_name: String,
    payload: Vec<u8>,
}

impl Task {
    /// Creates a task with a raw payload.
    pub fn new(type_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }

    /// Creates a task whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(
        type_name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    /// Returns the handler type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the raw payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// The durable record of one task instance.
///
/// A message is written by the broker into exactly one state collection
/// of its queue and moves between collections only through broker
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    /// Handler type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Opaque handler-interpreted payload.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Unique identifier, never reused.
    pub id: String,
    /// Lower-cased queue name.
    pub queue: String,
    /// Retry budget.
    pub max_retry: u32,
    /// Attempts already made and failed.
    pub retried: u32,
    /// Per-attempt execution limit; zero means unbounded.
    #[serde(default)]
    pub timeout: Duration,
    /// Absolute time after which the task must not be attempted.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Uniqueness lock key, scoped to the queue.
    #[serde(default)]
    pub unique_key: Option<String>,
    /// Description of the last failure.
    #[serde(default)]
    pub error_msg: Option<String>,
    /// When the last attempt failed.
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
    /// When the task finished successfully.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// How long to keep the message after completion.
    #[serde(default)]
    pub retention: Duration,
}

impl TaskMessage {
    /// Creates a message for `task` with default options.
    pub fn new(task: &Task) -> Self {
        Self {
            type_name: task.type_name.clone(),
            payload: task.payload.clone(),
            id: Uuid::new_v4().to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            retried: 0,
            timeout: Duration::ZERO,
            deadline: None,
            unique_key: None,
            error_msg: None,
            last_failed_at: None,
            completed_at: None,
            retention: Duration::ZERO,
        }
    }

    /// Encodes the message for storage.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a stored message.
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Rebuilds the producer-facing task.
    pub fn task(&self) -> Task {
        Task::new(self.type_name.clone(), self.payload.clone())
    }

    /// Returns whether the retry budget has room for another attempt.
    pub fn has_retry_budget(&self) -> bool {
        self.retried < self.max_retry
    }

    /// Returns whether the deadline, if any, is at or before `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Returns the time budget for one attempt started at `now`.
    ///
    /// The sooner of `timeout` and the remaining time to `deadline`;
    /// `None` if neither is set.
    pub fn attempt_budget(&self, now: DateTime<Utc>) -> Option<Duration> {
        let timeout = (!self.timeout.is_zero()).then_some(self.timeout);
        let until_deadline = self
            .deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO));

        match (timeout, until_deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (t, d) => t.or(d),
        }
    }

    /// Returns a copy recording a failed attempt.
    pub fn with_failure(&self, error_msg: &str, now: DateTime<Utc>) -> Self {
        let mut msg = self.clone();
        msg.error_msg = Some(error_msg.to_string());
        msg.last_failed_at = Some(now);
        msg
    }

    /// Returns a copy recording a failed attempt that will be retried.
    pub fn for_retry(&self, error_msg: &str, now: DateTime<Utc>) -> Self {
        let mut msg = self.with_failure(error_msg, now);
        msg.retried += 1;
        msg
    }

    /// Returns a copy marked as completed at `now`.
    pub fn completed(&self, now: DateTime<Utc>) -> Self {
        let mut msg = self.clone();
        msg.completed_at = Some(now);
        msg
    }
}

/// Derives the uniqueness key for a task: its type plus a digest of its payload.
pub fn unique_key(type_name: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{}:{}", type_name, hex::encode(hasher.finalize()))
}

/// Summary of a stored task returned to producers.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub type_name: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub timeout: Duration,
    pub deadline: Option<DateTime<Utc>>,
    /// When the task becomes eligible for processing.
    pub next_process_at: DateTime<Utc>,
}

impl TaskInfo {
    pub(crate) fn new(msg: &TaskMessage, state: TaskState, next_process_at: DateTime<Utc>) -> Self {
        Self {
            id: msg.id.clone(),
            queue: msg.queue.clone(),
            type_name: msg.type_name.clone(),
            state,
            max_retry: msg.max_retry,
            retried: msg.retried,
            timeout: msg.timeout,
            deadline: msg.deadline,
            next_process_at,
        }
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
