//! Forwarder: promotes due scheduled tasks to pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::error::BrokerError;

pub struct Forwarder {
    broker: Arc<dyn Broker>,
    /// Queues to forward; every known queue when empty.
    queues: Vec<String>,
    interval: Duration,
}

impl Forwarder {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            broker,
            queues: Vec::new(),
            interval,
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
                    if let Err(e) = self.forward_once().await {
                        error!(error = %e, "Forwarding scheduled tasks failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Forwarder stopped");
    }

    /// Moves every due scheduled task to pending. Returns the number moved.
    pub async fn forward_once(&self) -> Result<usize, BrokerError> {
        let queues = if self.queues.is_empty() {
            self.broker.queues().await?
        } else {
            self.queues.clone()
        };

        let moved = self.broker.forward_scheduled(&queues).await?;
        if moved > 0 {
            debug!(moved = moved, "Forwarded scheduled tasks");
        }
        Ok(moved)
    }
}
