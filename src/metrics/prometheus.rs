//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by taskq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks accepted by a client, labeled by queue and kind (enqueued/scheduled).
pub static TASKS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Finished attempts, labeled by queue and outcome (success/retry/archive/requeue).
pub static TASKS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution duration in seconds, labeled by queue and task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks per queue and state, as last sampled.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently being processed by this instance.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of worker tasks running in this instance.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Tasks recovered from an expired lease, labeled by queue and outcome (requeue/archive).
pub static LEASES_RECOVERED: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Client metrics
    let tasks_enqueued = CounterVec::new(
        Opts::new("taskq_tasks_enqueued_total", "Total number of tasks enqueued"),
        &["queue", "kind"],
    )?;

    // Processor metrics
    let tasks_processed = CounterVec::new(
        Opts::new(
            "taskq_tasks_processed_total",
            "Total number of task attempts finished",
        ),
        &["queue", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "taskq_task_duration_seconds",
            "Handler execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["queue", "type"],
    )?;

    let tasks_in_progress = Gauge::new(
        "taskq_tasks_in_progress",
        "Number of tasks currently being processed",
    )?;

    let active_workers = Gauge::new("taskq_active_workers", "Number of running workers")?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("taskq_queue_depth", "Number of tasks per queue and state"),
        &["queue", "state"],
    )?;

    let leases_recovered = CounterVec::new(
        Opts::new(
            "taskq_leases_recovered_total",
            "Total number of tasks recovered from expired leases",
        ),
        &["queue", "outcome"],
    )?;

    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(tasks_processed.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(leases_recovered.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = TASKS_PROCESSED.set(tasks_processed);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = LEASES_RECOVERED.set(leases_recovered);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
