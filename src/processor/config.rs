//! Processor configuration.

use std::time::Duration;

use super::backoff::Backoff;
use crate::config::{parse_env_list, parse_env_millis, parse_env_secs, parse_env_value};
use crate::error::ConfigError;
use crate::task::{normalize_queue_name, DEFAULT_QUEUE};

/// Configuration for a [`Processor`](super::Processor) and its background loops.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of tasks processed at once.
    pub concurrency: usize,
    /// Queues to pull from, highest priority first.
    pub queues: Vec<String>,
    /// Delay before a failed task is retried.
    pub retry_backoff: Backoff,
    /// Sleep of an idle worker between polls.
    pub poll_backoff: Backoff,
    /// Pause after an unavailable backing store.
    pub broker_backoff: Backoff,
    /// How often leases are extended and the server record refreshed.
    pub heartbeat_interval: Duration,
    /// How often expired leases are recovered.
    pub recoverer_interval: Duration,
    /// How often due scheduled tasks are moved to pending.
    pub forwarder_interval: Duration,
    /// How often expired completed tasks are deleted.
    pub janitor_interval: Duration,
    /// Grace period for in-flight handlers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queues: vec![DEFAULT_QUEUE.to_string()],
            retry_backoff: Backoff::retry_default(),
            poll_backoff: Backoff::poll_default(),
            broker_backoff: Backoff::broker_default(),
            heartbeat_interval: Duration::from_secs(5),
            recoverer_interval: Duration::from_secs(10),
            forwarder_interval: Duration::from_secs(1),
            janitor_interval: Duration::from_secs(8),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessorConfig {
    /// Creates a new configuration with the specified concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKQ_CONCURRENCY`: Worker count (default: available parallelism)
    /// - `TASKQ_QUEUES`: Comma-separated queues, highest priority first (default: default)
    /// - `TASKQ_HEARTBEAT_SECS`: Heartbeat interval (default: 5)
    /// - `TASKQ_RECOVERER_SECS`: Recoverer interval (default: 10)
    /// - `TASKQ_FORWARDER_MILLIS`: Forwarder interval (default: 1000)
    /// - `TASKQ_JANITOR_SECS`: Janitor interval (default: 8)
    /// - `TASKQ_SHUTDOWN_TIMEOUT_SECS`: Shutdown grace period (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKQ_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "TASKQ_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("TASKQ_QUEUES") {
            config = config.with_queues(parse_env_list(&val));
        }

        if let Ok(val) = std::env::var("TASKQ_HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_env_secs(&val, "TASKQ_HEARTBEAT_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKQ_RECOVERER_SECS") {
            config.recoverer_interval = parse_env_secs(&val, "TASKQ_RECOVERER_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKQ_FORWARDER_MILLIS") {
            config.forwarder_interval = parse_env_millis(&val, "TASKQ_FORWARDER_MILLIS")?;
        }

        if let Ok(val) = std::env::var("TASKQ_JANITOR_SECS") {
            config.janitor_interval = parse_env_secs(&val, "TASKQ_JANITOR_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKQ_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = parse_env_secs(&val, "TASKQ_SHUTDOWN_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one queue is required".to_string(),
            ));
        }

        // Queue names are the Redis Cluster hash tag of every key.
        if let Some(queue) = self.queues.iter().find(|q| q.contains(['{', '}'])) {
            return Err(ConfigError::ValidationFailed(format!(
                "queue name '{}' cannot contain braces",
                queue
            )));
        }

        for (name, interval) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("recoverer_interval", self.recoverer_interval),
            ("forwarder_interval", self.forwarder_interval),
            ("janitor_interval", self.janitor_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Checks that leases are renewed at least twice per lease period.
    pub fn validate_lease(&self, lease_duration: Duration) -> Result<(), ConfigError> {
        if self.heartbeat_interval.saturating_mul(2) >= lease_duration {
            return Err(ConfigError::ValidationFailed(format!(
                "heartbeat_interval ({:?}) must be less than half the lease duration ({:?})",
                self.heartbeat_interval, lease_duration
            )));
        }
        Ok(())
    }

    /// Sets the queues, highest priority first. Names are normalized and
    /// duplicates dropped.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for queue in queues {
            let name = normalize_queue_name(queue.as_ref());
            if !name.is_empty() && !normalized.contains(&name) {
                normalized.push(name);
            }
        }
        self.queues = normalized;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_poll_backoff(mut self, backoff: Backoff) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn with_broker_backoff(mut self, backoff: Backoff) -> Self {
        self.broker_backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_recoverer_interval(mut self, interval: Duration) -> Self {
        self.recoverer_interval = interval;
        self
    }

    pub fn with_forwarder_interval(mut self, interval: Duration) -> Self {
        self.forwarder_interval = interval;
        self
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
