//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, LEASES_RECOVERED, QUEUE_DEPTH, TASKS_ENQUEUED, TASKS_IN_PROGRESS,
    TASKS_PROCESSED, TASK_DURATION,
};
use crate::broker::QueueStats;

/// How a task attempt ended, as seen by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry,
    Archive,
    Requeue,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry => "retry",
            Outcome::Archive => "archive",
            Outcome::Requeue => "requeue",
        }
    }
}

/// Metrics collector for recording taskq operational metrics.
///
/// # Example
///
/// ```ignore
/// use taskq::metrics::{init_metrics, MetricsCollector, Outcome};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_processed("default", "send_email", Outcome::Success, 0.25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task accepted by a client. `kind` is "enqueued" or "scheduled".
    pub fn record_enqueued(&self, queue: &str, kind: &str) {
        if let Some(enqueued) = TASKS_ENQUEUED.get() {
            enqueued.with_label_values(&[queue, kind]).inc();
        }

        tracing::trace!(queue = queue, kind = kind, "Recorded enqueue metric");
    }

    /// Record a finished attempt and how long its handler ran.
    pub fn record_processed(
        &self,
        queue: &str,
        task_type: &str,
        outcome: Outcome,
        duration_secs: f64,
    ) {
        if let Some(processed) = TASKS_PROCESSED.get() {
            processed
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(duration) = TASK_DURATION.get() {
            duration
                .with_label_values(&[queue, task_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            task_type = task_type,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a task recovered from an expired lease.
    pub fn record_lease_recovered(&self, queue: &str, outcome: Outcome) {
        if let Some(recovered) = LEASES_RECOVERED.get() {
            recovered
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }
    }

    /// Publish the per-state sizes of one queue.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        let Some(depth) = QUEUE_DEPTH.get() else {
            return;
        };

        for (state, count) in [
            ("pending", stats.pending),
            ("active", stats.active),
            ("scheduled", stats.scheduled),
            ("archived", stats.archived),
            ("completed", stats.completed),
        ] {
            depth
                .with_label_values(&[stats.queue.as_str(), state])
                .set(count as f64);
        }
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(workers) = ACTIVE_WORKERS.get() {
            workers.set(count as f64);
        }
    }

    pub fn inc_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    pub fn dec_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }
}
