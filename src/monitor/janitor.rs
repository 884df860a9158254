//! Janitor: deletes completed tasks past their retention and samples
//! queue depth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::metrics::MetricsCollector;

pub struct Janitor {
    broker: Arc<dyn Broker>,
    /// Queues to clean; every known queue when empty.
    queues: Vec<String>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl Janitor {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            broker,
            queues: Vec::new(),
            interval,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.clean_once().await {
                        error!(error = %e, "Deleting expired completed tasks failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Janitor stopped");
    }

    /// Deletes expired completed tasks. Returns the number deleted.
    pub async fn clean_once(&self) -> Result<usize, BrokerError> {
        let queues = if self.queues.is_empty() {
            self.broker.queues().await?
        } else {
            self.queues.clone()
        };

        let mut deleted = 0;
        for queue in &queues {
            deleted += self.broker.delete_expired_completed(queue).await?;
            self.metrics
                .update_queue_depth(&self.broker.queue_stats(queue).await?);
        }

        if deleted > 0 {
            debug!(deleted = deleted, "Deleted expired completed tasks");
        }
        Ok(deleted)
    }
}
