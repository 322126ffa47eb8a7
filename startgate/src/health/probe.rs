//! Consecutive-failure classification and the periodic monitor.

use super::checker::{CheckFailure, HealthChecker};
use super::policy::HealthPolicy;
use crate::cancellation::CancellationToken;
use crate::core::HealthState;
use crate::events::{EventSink, NoOpEventSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs one check, bounded by `timeout`.
pub async fn check_with_timeout(
    checker: &dyn HealthChecker,
    timeout: Duration,
) -> Result<(), CheckFailure> {
    match tokio::time::timeout(timeout, checker.check()).await {
        Ok(result) => result,
        Err(_) => Err(CheckFailure::new(format!("no answer within {timeout:?}"))),
    }
}

/// Classifies a sequence of check results.
///
/// `retries` consecutive failures mark the instance unhealthy; any success
/// resets the count. Failures inside the start period are ignored.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    policy: HealthPolicy,
    started: Instant,
    consecutive_failures: u32,
    state: HealthState,
    last_error: Option<String>,
}

impl HealthProbe {
    /// Creates a probe whose start period begins now.
    #[must_use]
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            consecutive_failures: 0,
            state: HealthState::Starting,
            last_error: None,
        }
    }

    /// Current classification.
    #[must_use]
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Failures since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The most recent failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns true while failures are not counted.
    #[must_use]
    pub fn in_start_period(&self) -> bool {
        self.started.elapsed() < self.policy.start_period
    }

    /// Records a passing check.
    pub fn record_success(&mut self) -> HealthState {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.state = HealthState::Healthy;
        self.state
    }

    /// Records a failing check.
    pub fn record_failure(&mut self, failure: &CheckFailure) -> HealthState {
        self.last_error = Some(failure.to_string());
        if self.in_start_period() {
            debug!(error = %failure, "Health check failed during start period");
            return self.state;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.policy.retries {
            self.state = HealthState::Unhealthy;
        }
        self.state
    }

    /// Runs one check and records its result.
    pub async fn check(&mut self, checker: &dyn HealthChecker) -> HealthState {
        match check_with_timeout(checker, self.policy.timeout).await {
            Ok(()) => self.record_success(),
            Err(failure) => self.record_failure(&failure),
        }
    }
}

/// Probes the server periodically and publishes the classification.
///
/// Purely observational: it issues read-only requests and shares no state
/// with the orchestrator.
pub struct HealthMonitor {
    checker: Arc<dyn HealthChecker>,
    policy: HealthPolicy,
    cancel: Arc<CancellationToken>,
    event_sink: Arc<dyn EventSink>,
    state: watch::Sender<HealthState>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("policy", &self.policy)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(checker: Arc<dyn HealthChecker>, policy: HealthPolicy) -> Self {
        let (state, _) = watch::channel(HealthState::Starting);
        Self {
            checker,
            policy,
            cancel: Arc::new(CancellationToken::new()),
            event_sink: Arc::new(NoOpEventSink),
            state,
        }
    }

    /// Sets the token that stops the monitor.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the event sink for state transitions.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Receives every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }

    /// Probes until cancelled and returns the last classification.
    pub async fn run(&self) -> HealthState {
        let mut probe = HealthProbe::new(self.policy);
        info!(
            interval_ms = self.policy.interval.as_millis() as u64,
            retries = self.policy.retries,
            "Health monitor started"
        );

        loop {
            let previous = probe.state();
            let current = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                state = probe.check(self.checker.as_ref()) => state,
            };

            if current != previous {
                match current {
                    HealthState::Unhealthy => warn!(
                        failures = probe.consecutive_failures(),
                        error = probe.last_error().unwrap_or_default(),
                        "Instance is unhealthy"
                    ),
                    _ => info!(state = %current, "Health state changed"),
                }
                self.event_sink.try_emit(
                    "health.changed",
                    Some(serde_json::json!({
                        "from": previous.to_string(),
                        "to": current.to_string(),
                        "consecutive_failures": probe.consecutive_failures(),
                    })),
                );
                self.state.send_replace(current);
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.policy.interval) => {}
            }
        }

        debug!(state = %probe.state(), "Health monitor stopped");
        probe.state()
    }
}
