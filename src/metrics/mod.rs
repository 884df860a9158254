//! Prometheus metrics for taskq.
//!
//! # Example
//!
//! ```ignore
//! use taskq::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, Outcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, LEASES_RECOVERED, QUEUE_DEPTH, REGISTRY, TASKS_ENQUEUED, TASKS_IN_PROGRESS,
    TASKS_PROCESSED, TASK_DURATION,
};
