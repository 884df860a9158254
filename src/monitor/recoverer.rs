//! Recoverer: returns tasks whose lease expired to circulation.
//!
//! A lease expires when the instance holding it stopped heartbeating,
//! typically because it crashed. Each expired task counts as one failed
//! attempt: it goes back to pending with `retried + 1` while its budget
//! lasts, and is archived otherwise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{failure_transition, Broker, FailureTransition};
use crate::error::BrokerError;
use crate::metrics::{MetricsCollector, Outcome};

/// Error message stored on tasks recovered from an expired lease.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Result of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub archived: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.archived
    }
}

/// Periodically recovers expired leases across every known queue.
///
/// Runs inside each processor, or standalone as a dedicated recovery role.
pub struct Recoverer {
    broker: Arc<dyn Broker>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl Recoverer {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            broker,
            interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// Recovers until shutdown is signaled.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_once().await {
                        error!(error = %e, "Lease recovery failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Recoverer stopped");
    }

    /// Runs one recovery pass over leases expired as of now.
    pub async fn recover_once(&self) -> Result<RecoveryReport, BrokerError> {
        let now = Utc::now();
        let expired = self.broker.list_lease_expired(now).await?;
        let mut report = RecoveryReport::default();

        for leased in expired {
            let msg = &leased.message;
            let result = match failure_transition(msg, true, now) {
                FailureTransition::Retry => self
                    .broker
                    .requeue(&msg.for_retry(LEASE_EXPIRED, now), &leased.lease_id)
                    .await
                    .map(|()| Outcome::Requeue),
                FailureTransition::Archive => self
                    .broker
                    .archive(msg, &leased.lease_id, LEASE_EXPIRED)
                    .await
                    .map(|()| Outcome::Archive),
            };

            match result {
                Ok(outcome) => {
                    match outcome {
                        Outcome::Archive => report.archived += 1,
                        _ => report.requeued += 1,
                    }
                    self.metrics.record_lease_recovered(&msg.queue, outcome);
                    warn!(
                        task_id = %msg.id,
                        queue = %msg.queue,
                        outcome = outcome.as_str(),
                        "Recovered task from expired lease"
                    );
                }
                // Finished, renewed or recovered by someone else meanwhile.
                Err(BrokerError::TaskNotFound { .. }) => {
                    debug!(task_id = %msg.id, "Expired task no longer active");
                }
                Err(e) => return Err(e),
            }
        }

        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                archived = report.archived,
                "Lease recovery pass complete"
            );
        }

        Ok(report)
    }
}
