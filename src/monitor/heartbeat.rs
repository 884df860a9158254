//! Heartbeater: keeps this instance's leases and liveness record fresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::{add_duration, Broker, ServerInfo};
use crate::processor::pool::InFlight;

/// Extends the lease of every in-flight task and rewrites the server
/// record on a fixed interval.
pub struct Heartbeater {
    broker: Arc<dyn Broker>,
    info: ServerInfo,
    in_flight: Arc<InFlight>,
    interval: Duration,
}

impl Heartbeater {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        info: ServerInfo,
        in_flight: Arc<InFlight>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            info,
            in_flight,
            interval,
        }
    }

    /// Beats until shutdown is signaled. The first beat is immediate.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat().await,
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(server_id = %self.info.server_id, "Heartbeater stopped");
    }

    /// Writes the server record and extends every in-flight lease once.
    pub async fn beat(&mut self) {
        let in_flight = self.in_flight.snapshot();
        self.info.active_workers = in_flight.len();

        // Record outlives two missed beats.
        if let Err(e) = self
            .broker
            .write_server_state(&self.info, self.interval.saturating_mul(2))
            .await
        {
            warn!(server_id = %self.info.server_id, error = %e, "Failed to write server state");
        }

        let deadline = add_duration(Utc::now(), self.broker.lease_duration());
        for leased in &in_flight {
            let msg = &leased.message;
            match self
                .broker
                .extend_lease(msg, &leased.lease_id, deadline)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(
                    task_id = %msg.id,
                    queue = %msg.queue,
                    "Lease lost, task is no longer held by this instance"
                ),
                Err(e) => warn!(task_id = %msg.id, error = %e, "Failed to extend lease"),
            }
        }

        debug!(extended = in_flight.len(), "Heartbeat");
    }
}
