//! The readiness gate: bounded polling of the primary data dependency.

use super::policy::PollPolicy;
use super::probe::ConnectivityProbe;
use super::target::ReadinessTarget;
use crate::cancellation::CancellationToken;
use crate::core::ReadinessState;
use crate::errors::ReadinessError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One readiness wait. Created fresh on every start and never persisted.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    /// The dependency being waited for.
    pub target: ReadinessTarget,
    /// Interval and budget.
    pub policy: PollPolicy,
    state: ReadinessState,
    attempts: u32,
    elapsed: Duration,
    last_error: Option<String>,
}

impl ReadinessCheck {
    /// Creates a pending check.
    #[must_use]
    pub fn new(target: ReadinessTarget, policy: PollPolicy) -> Self {
        Self {
            target,
            policy,
            state: ReadinessState::Pending,
            attempts: 0,
            elapsed: Duration::ZERO,
            last_error: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReadinessState {
        self.state
    }

    /// Number of probes made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time spent waiting.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The most recent probe failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

enum Interrupted {
    Cancelled,
}

/// Polls a target until it accepts connections or the budget runs out.
///
/// Probe failures of every kind are treated alike; only exhausting the
/// timeout is fatal. Cancellation interrupts a probe or a sleep immediately.
#[derive(Clone)]
pub struct ReadinessGate {
    probe: Arc<dyn ConnectivityProbe>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl ReadinessGate {
    /// Creates a gate using `probe`.
    #[must_use]
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            probe,
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the token that aborts the wait.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Waits for `target` with fixed-interval polling.
    ///
    /// # Errors
    ///
    /// `TimedOut` when the budget is exhausted, `Cancelled` when aborted and
    /// `InvalidPolicy` for a zero interval or timeout.
    pub async fn await_ready(
        &self,
        target: &ReadinessTarget,
        interval: Duration,
        timeout: Duration,
    ) -> Result<ReadinessCheck, ReadinessError> {
        let mut check = ReadinessCheck::new(target.clone(), PollPolicy::fixed(interval, timeout));
        self.run(&mut check).await?;
        Ok(check)
    }

    /// Drives `check` to a terminal state.
    ///
    /// On timeout the check ends in `TimedOut`; on cancellation it stays
    /// `Pending`.
    ///
    /// # Errors
    ///
    /// See [`await_ready`](Self::await_ready).
    pub async fn run(&self, check: &mut ReadinessCheck) -> Result<(), ReadinessError> {
        check.policy.validate()?;

        let Some(endpoint) = check.target.endpoint.clone() else {
            info!(target = %check.target, "Dependency is local, no readiness wait needed");
            check.state = ReadinessState::Ready;
            return Ok(());
        };

        let timeout = check.policy.timeout;
        let start = Instant::now();
        info!(
            target = %check.target,
            interval_ms = check.policy.interval.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for dependency"
        );

        loop {
            check.attempts += 1;
            let remaining = timeout.saturating_sub(start.elapsed());

            let probe = tokio::time::timeout(remaining, self.probe.probe(&endpoint));
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(Interrupted::Cancelled),
                result = probe => Ok(result),
            };

            match outcome {
                Ok(Ok(Ok(()))) => {
                    check.elapsed = start.elapsed();
                    check.state = ReadinessState::Ready;
                    info!(
                        target = %check.target,
                        attempts = check.attempts,
                        elapsed_ms = check.elapsed.as_millis() as u64,
                        "Dependency is ready"
                    );
                    return Ok(());
                }
                Ok(Ok(Err(failure))) => check.last_error = Some(failure.to_string()),
                Ok(Err(_)) => check.last_error = Some("probe did not complete within the remaining budget".to_string()),
                Err(Interrupted::Cancelled) => return Err(self.cancelled(check, start)),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Self::timed_out(check, elapsed));
            }

            let delay = check
                .policy
                .delay_for(check.attempts - 1)
                .min(timeout.saturating_sub(elapsed));
            debug!(
                target = %check.target,
                attempt = check.attempts,
                delay_ms = delay.as_millis() as u64,
                error = check.last_error.as_deref().unwrap_or_default(),
                "Dependency not ready yet"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(self.cancelled(check, start)),
                () = tokio::time::sleep(delay) => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Self::timed_out(check, elapsed));
            }
        }
    }

    fn timed_out(check: &mut ReadinessCheck, elapsed: Duration) -> ReadinessError {
        check.elapsed = elapsed;
        check.state = ReadinessState::TimedOut;
        let err = ReadinessError::TimedOut {
            target: check.target.to_string(),
            elapsed,
            timeout: check.policy.timeout,
            attempts: check.attempts,
            last_error: check.last_error.clone().unwrap_or_default(),
        };
        warn!(error = %err, "Readiness wait timed out");
        err
    }

    fn cancelled(&self, check: &mut ReadinessCheck, start: Instant) -> ReadinessError {
        check.elapsed = start.elapsed();
        let reason = self.cancel.reason_or_default();
        warn!(target = %check.target, reason = %reason, "Readiness wait aborted");
        ReadinessError::Cancelled {
            target: check.target.to_string(),
            elapsed: check.elapsed,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::probe::{MockConnectivityProbe, ProbeFailure};

    const SEC: Duration = Duration::from_secs(1);

    fn target() -> ReadinessTarget {
        ReadinessTarget::tcp("db", 5432)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_probe() {
        let mut probe = MockConnectivityProbe::new();
        probe.expect_probe().times(1).returning(|_| Ok(()));

        let gate = ReadinessGate::new(Arc::new(probe));
        let check = gate.await_ready(&target(), SEC, SEC * 5).await.unwrap();
        assert_eq!(check.state(), ReadinessState::Ready);
        assert_eq!(check.attempts(), 1);
        assert_eq!(check.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_budget() {
        let mut probe = MockConnectivityProbe::new();
        probe
            .expect_probe()
            .returning(|_| Err(ProbeFailure::new("connection refused")));

        let gate = ReadinessGate::new(Arc::new(probe));
        let mut check = ReadinessCheck::new(target(), PollPolicy::fixed(SEC, SEC * 5));
        let err = gate.run(&mut check).await.unwrap_err();

        assert_eq!(check.state(), ReadinessState::TimedOut);
        assert_eq!(check.attempts(), 5);
        match err {
            ReadinessError::TimedOut { elapsed, last_error, target, .. } => {
                assert_eq!(elapsed, SEC * 5);
                assert_eq!(last_error, "connection refused");
                assert_eq!(target, "tcp://db:5432");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_is_rejected() {
        let probe = MockConnectivityProbe::new();
        let gate = ReadinessGate::new(Arc::new(probe));
        let err = gate.await_ready(&target(), SEC, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ReadinessError::InvalidPolicy(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_target_is_ready_without_probing() {
        let probe = MockConnectivityProbe::new();
        let gate = ReadinessGate::new(Arc::new(probe));
        let sqlite = ReadinessTarget::from_database_uri("sqlite:////tmp/x.db").unwrap();
        let check = gate.await_ready(&sqlite, SEC, SEC).await.unwrap();
        assert_eq!(check.state(), ReadinessState::Ready);
        assert_eq!(check.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let mut probe = MockConnectivityProbe::new();
        probe.expect_probe().returning(|_| Err(ProbeFailure::new("refused")));

        let cancel = Arc::new(CancellationToken::new());
        let gate = ReadinessGate::new(Arc::new(probe)).with_cancellation(cancel.clone());

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                cancel.cancel("SIGTERM");
            })
        };

        let mut check = ReadinessCheck::new(target(), PollPolicy::fixed(SEC * 10, SEC * 60));
        let err = gate.run(&mut check).await.unwrap_err();
        canceller.await.unwrap();

        assert_eq!(check.state(), ReadinessState::Pending);
        match err {
            ReadinessError::Cancelled { elapsed, reason, .. } => {
                assert_eq!(elapsed, Duration::from_millis(1500));
                assert_eq!(reason, "SIGTERM");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
