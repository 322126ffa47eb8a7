//! Poll interval and timeout budget for the readiness gate.

use crate::errors::ReadinessError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between probes evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = interval
    #[default]
    Constant,
    /// delay = interval * (attempt + 1)
    Linear,
    /// delay = interval * 2^attempt
    Exponential,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Readiness polling policy.
///
/// The default is fixed-interval polling. The timeout is always finite and
/// non-zero: there is no "wait forever" setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Base delay between probes.
    pub interval: Duration,
    /// Total budget for the wait.
    pub timeout: Duration,
    /// Cap on a single delay.
    pub max_interval: Duration,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl PollPolicy {
    /// Fixed-interval polling.
    #[must_use]
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_interval: interval,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the cap on a single delay.
    #[must_use]
    pub fn with_max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Checks the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` for a zero timeout or a zero interval.
    pub fn validate(&self) -> Result<(), ReadinessError> {
        if self.timeout.is_zero() {
            return Err(ReadinessError::InvalidPolicy(
                "timeout must be greater than zero; unbounded waits are not allowed".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ReadinessError::InvalidPolicy(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (0-indexed), before
    /// clipping to the remaining budget.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.interval;
        let cap = self.max_interval.max(base);

        let delay = match self.backoff {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => base.saturating_mul(2u32.saturating_pow(attempt)),
        }
        .min(cap);

        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay.is_zero() {
                    delay
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half.is_zero() {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(Duration::ZERO..=half)
                }
            }
        }
    }
}
