//! taskq: a distributed task queue.
//!
//! Producers enqueue typed tasks through a [`Client`](client::Client); a
//! [`Broker`](broker::Broker) stores them in Redis and moves each task
//! through its state machine atomically; [`Processor`](processor::Processor)
//! instances pull tasks, run registered handlers, and report outcomes.
//! Leases renewed by heartbeats let any instance recover tasks held by
//! one that crashed.

pub mod broker;
pub mod cli;
pub mod client;
pub(crate) mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod task;

// Re-export commonly used types
pub use broker::{Broker, BrokerConfig, MemoryBroker, RedisBroker, TaskState};
pub use client::{Client, ClientConfig};
pub use error::{BrokerError, ClientError, ConfigError, TaskError};
pub use processor::{HandlerRegistry, Processor, ProcessorConfig, SkipRetry, TaskContext};
pub use task::{Task, TaskInfo, TaskMessage, TaskOption};
