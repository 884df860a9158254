//! Task processing: a bounded worker pool running registered handlers.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Broker    │
//!                      └──────┬───────┘
//!                             │ dequeue (priority order)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──── done / retry / archive ───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskq::broker::{BrokerConfig, RedisBroker};
//! use taskq::processor::{HandlerRegistry, Processor, ProcessorConfig};
//!
//! let broker = Arc::new(RedisBroker::connect(BrokerConfig::from_env()?).await?);
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.handle_fn("send_email", |_ctx, task| async move {
//!     let email: Email = task.payload_json()?;
//!     deliver(email).await
//! });
//!
//! let mut processor = Processor::new(ProcessorConfig::from_env()?, broker, handlers)?;
//! processor.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

pub mod backoff;
pub mod config;
pub mod handler;
pub mod pool;

pub use backoff::Backoff;
pub use config::ProcessorConfig;
pub use handler::{Handler, HandlerFn, HandlerRegistry, SkipRetry, TaskContext};
pub use pool::{PoolStats, Processor, ProcessorError};
