//! Worker pool pulling tasks from the broker.
//!
//! A [`Processor`] runs a fixed number of workers plus the background
//! loops of the lease protocol (heartbeater, recoverer, forwarder,
//! janitor). Each worker repeatedly dequeues one task, runs its handler
//! under the task's time budget, and reports the outcome to the broker.
//!
//! # Features
//!
//! - Strict queue priority, FIFO within a queue
//! - Hard per-attempt timeout and deadline enforcement
//! - Panics in handlers are caught and counted as failures
//! - Graceful shutdown: in-flight tasks get a grace period, the rest are
//!   requeued for other instances

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::config::ProcessorConfig;
use super::handler::{is_skip_retry, HandlerRegistry, TaskContext};
use crate::broker::{
    add_duration, failure_transition, Broker, FailureTransition, LeasedTask, ServerInfo,
};
use crate::error::{BrokerError, ConfigError, TaskError};
use crate::metrics::{MetricsCollector, Outcome};
use crate::monitor::{Forwarder, Heartbeater, Janitor, Recoverer};
use crate::task::TaskMessage;

/// Errors that can occur in the processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The configuration is invalid.
    #[error("Invalid processor configuration: {0}")]
    Config(#[from] ConfigError),

    /// Processor is already running.
    #[error("Processor is already running")]
    AlreadyRunning,

    /// Processor is not running.
    #[error("Processor is not running")]
    NotRunning,

    /// No handler is registered.
    #[error("No handlers registered")]
    NoHandlers,
}

/// Statistics about the processor.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of workers in the pool.
    pub concurrency: usize,
    /// Number of workers currently running a handler.
    pub active_workers: usize,
    /// Attempts that succeeded.
    pub tasks_succeeded: u64,
    /// Attempts that did not succeed.
    pub tasks_failed: u64,
    /// Average handler duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts finished.
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_success(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, concurrency: usize) -> PoolStats {
        let succeeded = self.tasks_succeeded.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            concurrency,
            active_workers: active as usize,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            average_task_duration: average_duration,
        }
    }
}

/// Leases currently being processed by this instance, keyed by task id.
///
/// The heartbeater extends every entry.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    tasks: Mutex<HashMap<String, LeasedTask>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LeasedTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, leased: &LeasedTask) {
        self.lock().insert(leased.message.id.clone(), leased.clone());
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<LeasedTask> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Runs handlers for tasks pulled from the broker.
pub struct Processor {
    config: ProcessorConfig,
    broker: Arc<dyn Broker>,
    handlers: Arc<HandlerRegistry>,
    server_id: String,
    /// Stops the workers first.
    worker_shutdown_tx: watch::Sender<bool>,
    /// Stops the background loops once no worker holds a lease.
    monitor_shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    monitor_handles: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl Processor {
    /// Creates a processor. The configuration is validated against the
    /// broker's lease duration.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Config` for an invalid configuration and
    /// `ProcessorError::NoHandlers` for an empty registry.
    pub fn new(
        config: ProcessorConfig,
        broker: Arc<dyn Broker>,
        handlers: HandlerRegistry,
    ) -> Result<Self, ProcessorError> {
        config.validate()?;
        config.validate_lease(broker.lease_duration())?;

        if handlers.is_empty() {
            return Err(ProcessorError::NoHandlers);
        }

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let server_id = format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4());

        let (worker_shutdown_tx, _) = watch::channel(false);
        // Buffer size of 1 is sufficient since we only send once
        let (monitor_shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            broker,
            handlers: Arc::new(handlers),
            server_id,
            worker_shutdown_tx,
            monitor_shutdown_tx,
            worker_handles: Vec::new(),
            monitor_handles: Vec::new(),
            in_flight: Arc::new(InFlight::default()),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Starts the workers and background loops.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::AlreadyRunning` if the processor is already running.
    pub fn start(&mut self) -> Result<(), ProcessorError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(ProcessorError::AlreadyRunning);
        }

        self.worker_shutdown_tx.send_replace(false);

        for i in 0..self.config.concurrency {
            let worker = Worker {
                id: format!("worker-{}", i),
                server_id: self.server_id.clone(),
                broker: Arc::clone(&self.broker),
                handlers: Arc::clone(&self.handlers),
                queues: self.config.queues.clone(),
                shutdown_rx: self.worker_shutdown_tx.subscribe(),
                poll_backoff: self.config.poll_backoff,
                retry_backoff: self.config.retry_backoff,
                broker_backoff: self.config.broker_backoff,
                in_flight: Arc::clone(&self.in_flight),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let heartbeater = Heartbeater::new(
            Arc::clone(&self.broker),
            self.server_info(),
            Arc::clone(&self.in_flight),
            self.config.heartbeat_interval,
        );
        let recoverer = Recoverer::new(Arc::clone(&self.broker), self.config.recoverer_interval);
        let forwarder = Forwarder::new(Arc::clone(&self.broker), self.config.forwarder_interval)
            .with_queues(self.config.queues.clone());
        let janitor = Janitor::new(Arc::clone(&self.broker), self.config.janitor_interval)
            .with_queues(self.config.queues.clone());

        self.monitor_handles = vec![
            tokio::spawn(heartbeater.run(self.monitor_shutdown_tx.subscribe())),
            tokio::spawn(recoverer.run(self.monitor_shutdown_tx.subscribe())),
            tokio::spawn(forwarder.run(self.monitor_shutdown_tx.subscribe())),
            tokio::spawn(janitor.run(self.monitor_shutdown_tx.subscribe())),
        ];

        MetricsCollector::new().update_workers(self.config.concurrency);
        info!(
            server_id = %self.server_id,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Processor started"
        );

        Ok(())
    }

    /// Stops pulling tasks and shuts down.
    ///
    /// In-flight handlers get `shutdown_timeout` to finish while the
    /// heartbeater keeps their leases alive; the rest are aborted and
    /// their tasks moved back to pending. Finally the background loops stop
    /// and the server record is removed.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::NotRunning` if the processor is not running.
    pub async fn shutdown(&mut self) -> Result<(), ProcessorError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(ProcessorError::NotRunning);
        }

        info!(server_id = %self.server_id, "Initiating processor shutdown");

        self.worker_shutdown_tx.send_replace(true);

        let mut workers = std::mem::take(&mut self.worker_handles);
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            for handle in workers.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                in_flight = self.in_flight.len(),
                "Shutdown grace period elapsed, aborting in-flight tasks"
            );
            for handle in &workers {
                handle.abort();
            }
            for handle in workers {
                let _ = handle.await;
            }
        }

        // Leases stay renewed until every worker has stopped.
        let _ = self.monitor_shutdown_tx.send(());
        for handle in self.monitor_handles.drain(..) {
            let _ = handle.await;
        }
        self.in_flight.clear();

        match self.broker.requeue_all(&self.server_id).await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued = requeued, "Requeued unfinished tasks"),
            Err(e) => error!(
                error = %e,
                "Failed to requeue unfinished tasks, leaving them to lease recovery"
            ),
        }

        if let Err(e) = self.broker.clear_server_state(&self.server_id).await {
            warn!(error = %e, "Failed to clear server state");
        }

        MetricsCollector::new().update_workers(0);
        self.is_running.store(false, Ordering::SeqCst);
        info!(server_id = %self.server_id, "Processor shutdown complete");
        Ok(())
    }

    /// Starts, waits for `signal`, then shuts down.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<(), ProcessorError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        self.shutdown().await
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.concurrency)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Identifier under which this instance leases tasks.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.server_id.clone(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            queues: self.config.queues.clone(),
            concurrency: self.config.concurrency,
            active_workers: 0,
            started_at: Utc::now(),
        }
    }
}

/// A single worker that processes tasks one at a time.
struct Worker {
    id: String,
    server_id: String,
    broker: Arc<dyn Broker>,
    handlers: Arc<HandlerRegistry>,
    /// Highest priority first.
    queues: Vec<String>,
    /// Turns true once shutdown begins.
    shutdown_rx: watch::Receiver<bool>,
    poll_backoff: Backoff,
    retry_backoff: Backoff,
    broker_backoff: Backoff,
    in_flight: Arc<InFlight>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        let mut idle_polls: u32 = 0;
        let mut broker_failures: u32 = 0;

        loop {
            // Check for shutdown signal (non-blocking)
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.broker.dequeue(&self.server_id, &self.queues).await {
                Ok(leased) => {
                    idle_polls = 0;
                    broker_failures = 0;
                    self.process(leased).await;
                }
                Err(BrokerError::NoTaskAvailable) => {
                    broker_failures = 0;
                    let delay = self.poll_backoff.delay(idle_polls);
                    idle_polls = idle_polls.saturating_add(1);
                    debug!(worker_id = %self.id, delay = ?delay, "No tasks available");
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
                Err(e) => {
                    let delay = self.broker_backoff.delay(broker_failures);
                    broker_failures = broker_failures.saturating_add(1);
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps for `delay`. Returns true if shutdown was signaled meanwhile.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.changed() => true,
        }
    }

    async fn process(&self, leased: LeasedTask) {
        let start_time = Instant::now();
        let msg = &leased.message;

        info!(
            worker_id = %self.id,
            task_id = %msg.id,
            queue = %msg.queue,
            task_type = %msg.type_name,
            attempt = msg.retried + 1,
            "Processing task"
        );

        self.in_flight.insert(&leased);
        self.stats.increment_active();
        self.metrics.inc_tasks_in_progress();

        let result = self.execute(msg, Utc::now()).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_tasks_in_progress();

        let outcome = match result {
            Ok(()) => {
                self.stats.record_success(duration);
                self.complete(&leased, duration).await
            }
            Err(err) => {
                self.stats.record_failure(duration);
                self.fail(&leased, err).await
            }
        };

        if let Some(outcome) = outcome {
            self.metrics.record_processed(
                &msg.queue,
                &msg.type_name,
                outcome,
                duration.as_secs_f64(),
            );
        }

        // Leases stay renewed until the broker has the outcome.
        self.in_flight.remove(&msg.id);
    }

    /// Runs the handler for `msg` under its time budget.
    async fn execute(&self, msg: &TaskMessage, now: DateTime<Utc>) -> Result<(), TaskError> {
        if msg.deadline_passed(now) {
            return Err(TaskError::DeadlineExceeded);
        }

        let Some(handler) = self.handlers.get(&msg.type_name) else {
            return Err(TaskError::UnregisteredHandler(msg.type_name.clone()));
        };

        let ctx = TaskContext::from_message(msg);
        let attempt = AssertUnwindSafe(handler.process_task(ctx, msg.task())).catch_unwind();

        let result = match msg.attempt_budget(now) {
            Some(budget) => match tokio::time::timeout(budget, attempt).await {
                Ok(result) => result,
                Err(_) if msg.deadline_passed(Utc::now()) => {
                    return Err(TaskError::DeadlineExceeded)
                }
                Err(_) => return Err(TaskError::HandlerTimeout(budget)),
            },
            None => attempt.await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_skip_retry(&e) => Err(TaskError::SkipRetry(format!("{:#}", e))),
            Ok(Err(e)) => Err(TaskError::HandlerExecutionFailed(format!("{:#}", e))),
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn complete(&self, leased: &LeasedTask, duration: Duration) -> Option<Outcome> {
        let msg = &leased.message;
        self.with_broker_retry("done", msg, || self.broker.done(msg, &leased.lease_id))
            .await?;

        info!(
            worker_id = %self.id,
            task_id = %msg.id,
            duration_ms = duration.as_millis(),
            "Task completed successfully"
        );
        Some(Outcome::Success)
    }

    async fn fail(&self, leased: &LeasedTask, err: TaskError) -> Option<Outcome> {
        let msg = &leased.message;
        let now = Utc::now();
        let error_msg = err.to_string();

        match failure_transition(msg, err.is_retryable(), now) {
            FailureTransition::Retry => {
                let delay = self.retry_backoff.delay(msg.retried);
                let retry_at = add_duration(now, delay);

                let transition = self
                    .with_broker_retry("retry", msg, || {
                        self.broker
                            .retry(msg, &leased.lease_id, retry_at, &error_msg)
                    })
                    .await?;

                match transition {
                    FailureTransition::Retry => {
                        warn!(
                            worker_id = %self.id,
                            task_id = %msg.id,
                            error = %error_msg,
                            retry_in = ?delay,
                            remaining_retries = msg.max_retry.saturating_sub(msg.retried + 1),
                            "Task failed, scheduled for retry"
                        );
                        Some(Outcome::Retry)
                    }
                    FailureTransition::Archive => {
                        error!(worker_id = %self.id, task_id = %msg.id, error = %error_msg, "Task failed, archived");
                        Some(Outcome::Archive)
                    }
                }
            }
            FailureTransition::Archive => {
                self.with_broker_retry("archive", msg, || {
                    self.broker.archive(msg, &leased.lease_id, &error_msg)
                })
                .await?;

                error!(
                    worker_id = %self.id,
                    task_id = %msg.id,
                    error = %error_msg,
                    retried = msg.retried,
                    "Task failed, archived"
                );
                Some(Outcome::Archive)
            }
        }
    }

    /// Issues a broker call, retrying with backoff while the store is
    /// unreachable. Returns `None` if the call failed for another reason or
    /// shutdown began while waiting to retry; the task then stays active
    /// until it is requeued or its lease expires.
    async fn with_broker_retry<T, F, Fut>(&self, op: &str, msg: &TaskMessage, mut call: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut attempt = 0;

        loop {
            match call().await {
                Ok(value) => return Some(value),
                Err(e) if e.is_retryable() => {
                    if *shutdown_rx.borrow_and_update() {
                        warn!(
                            worker_id = %self.id,
                            task_id = %msg.id,
                            op = op,
                            error = %e,
                            "Broker unavailable during shutdown, giving up"
                        );
                        return None;
                    }

                    let delay = self.broker_backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        worker_id = %self.id,
                        task_id = %msg.id,
                        op = op,
                        error = %e,
                        retry_in = ?delay,
                        "Broker unavailable, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            warn!(
                                worker_id = %self.id,
                                task_id = %msg.id,
                                op = op,
                                "Shutdown signaled, abandoning broker retry"
                            );
                            return None;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        task_id = %msg.id,
                        op = op,
                        error = %e,
                        "Broker call failed"
                    );
                    return None;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
