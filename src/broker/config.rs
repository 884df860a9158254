//! Broker configuration.

use std::time::Duration;

use crate::config::{parse_env_secs, parse_env_value};
use crate::error::ConfigError;

/// Configuration shared by broker implementations.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// How long a dequeued task stays leased without renewal.
    pub lease_duration: Duration,
    /// Maximum number of archived tasks kept per queue.
    pub archived_max_size: usize,
    /// Archived tasks older than this are dropped.
    pub archived_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            lease_duration: Duration::from_secs(30),
            archived_max_size: 10_000,
            archived_ttl: Duration::from_secs(90 * 24 * 60 * 60), // 90 days
        }
    }
}

impl BrokerConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKQ_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `TASKQ_LEASE_SECS`: Lease duration in seconds (default: 30)
    /// - `TASKQ_ARCHIVED_MAX_SIZE`: Archived tasks kept per queue (default: 10000)
    /// - `TASKQ_ARCHIVED_TTL_SECS`: Archived task lifetime in seconds (default: 90 days)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKQ_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("TASKQ_LEASE_SECS") {
            config.lease_duration = parse_env_secs(&val, "TASKQ_LEASE_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKQ_ARCHIVED_MAX_SIZE") {
            config.archived_max_size = parse_env_value(&val, "TASKQ_ARCHIVED_MAX_SIZE")?;
        }

        if let Ok(val) = std::env::var("TASKQ_ARCHIVED_TTL_SECS") {
            config.archived_ttl = parse_env_secs(&val, "TASKQ_ARCHIVED_TTL_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.lease_duration < Duration::from_secs(1) {
            return Err(ConfigError::ValidationFailed(
                "lease_duration must be at least 1 second".to_string(),
            ));
        }

        if self.archived_max_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "archived_max_size must be greater than 0".to_string(),
            ));
        }

        if self.archived_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "archived_ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_archived_max_size(mut self, size: usize) -> Self {
        self.archived_max_size = size;
        self
    }

    pub fn with_archived_ttl(mut self, ttl: Duration) -> Self {
        self.archived_ttl = ttl;
        self
    }
}
