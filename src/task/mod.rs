//! Task model.
//!
//! - `Task`: handler type plus payload, as produced by callers
//! - `TaskMessage`: the durable per-instance record the broker stores
//! - `TaskOption` / `TaskOptions`: call-time options folded into a message

pub mod message;
pub mod options;

pub use message::{unique_key, Task, TaskInfo, TaskMessage};
pub use options::{normalize_queue_name, TaskOption, TaskOptions, DEFAULT_MAX_RETRY, DEFAULT_QUEUE};
