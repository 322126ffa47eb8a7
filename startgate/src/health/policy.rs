//! Health probe timing.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default status endpoint of the server.
pub const DEFAULT_HEALTHCHECK_URL: &str = "http://127.0.0.1:5000/healthcheck/status";

/// How often to probe and how many failures make an instance unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Time between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive failures that mark the instance unhealthy.
    pub retries: u32,
    /// Grace period after start during which failures are not counted.
    pub start_period: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
            start_period: Duration::ZERO,
        }
    }
}

impl HealthPolicy {
    /// Sets the probe interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the per-probe timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the start period.
    #[must_use]
    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    /// Checks that interval, timeout and retries are non-zero.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the offending setting without its
    /// environment prefix (`HEALTHCHECK_RETRIES`, ...).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("HEALTHCHECK_INTERVAL", "must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("HEALTHCHECK_TIMEOUT", "must be greater than zero"));
        }
        if self.retries == 0 {
            return Err(ConfigError::invalid("HEALTHCHECK_RETRIES", "must be at least 1"));
        }
        Ok(())
    }
}
