//! Timing behaviour of the readiness gate, on tokio's paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use startgate::cancellation::CancellationToken;
use startgate::core::ReadinessState;
use startgate::errors::ReadinessError;
use startgate::readiness::{ConnectivityProbe, Endpoint, ProbeFailure, ReadinessGate, ReadinessTarget};
use startgate::testing::ScriptedProbe;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready};

const SEC: Duration = Duration::from_secs(1);

fn target() -> ReadinessTarget {
    ReadinessTarget::from_database_uri("postgresql://linotp:secret@db/linotp").unwrap()
}

#[tokio::test(start_paused = true)]
async fn ready_within_one_interval_of_becoming_reachable() {
    let start = Instant::now();
    let gate = ReadinessGate::new(Arc::new(ScriptedProbe::reachable_after(3 * SEC)));

    let check = gate.await_ready(&target(), SEC, 5 * SEC).await.unwrap();

    assert_eq!(check.state(), ReadinessState::Ready);
    assert!(start.elapsed() >= 3 * SEC);
    assert!(start.elapsed() <= 4 * SEC);
    assert!(check.elapsed() <= 5 * SEC);
}

#[tokio::test(start_paused = true)]
async fn never_reachable_times_out_at_budget() {
    let start = Instant::now();
    let probe = Arc::new(ScriptedProbe::never());
    let gate = ReadinessGate::new(probe.clone());

    let err = gate.await_ready(&target(), SEC, 5 * SEC).await.unwrap_err();

    let elapsed = start.elapsed();
    assert!(elapsed >= 5 * SEC && elapsed <= 6 * SEC, "{elapsed:?}");
    match err {
        ReadinessError::TimedOut {
            target,
            attempts,
            last_error,
            ..
        } => {
            assert!(target.contains("@db/linotp"));
            assert!(!target.contains("secret"));
            assert_eq!(attempts, probe.attempts());
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hanging_probe_is_bounded_by_budget() {
    let start = Instant::now();
    let probe = ScriptedProbe::never().with_probe_time(Duration::from_secs(60));
    let gate = ReadinessGate::new(Arc::new(probe));

    let err = gate.await_ready(&target(), SEC, 5 * SEC).await.unwrap_err();
    assert!(matches!(err, ReadinessError::TimedOut { attempts: 1, .. }));
    assert_eq!(start.elapsed(), 5 * SEC);
}

#[tokio::test(start_paused = true)]
async fn polls_once_per_interval() {
    let gate = ReadinessGate::new(Arc::new(ScriptedProbe::reachable_after(3 * SEC)));
    let target = target();
    let mut wait = tokio_test::task::spawn(gate.await_ready(&target, SEC, 5 * SEC));

    assert_pending!(wait.poll());
    for _ in 0..2 {
        tokio::time::advance(SEC).await;
        assert_pending!(wait.poll());
    }
    tokio::time::advance(SEC).await;
    let check = assert_ready!(wait.poll()).unwrap();
    assert_eq!(check.attempts(), 4);
}

/// Fails with a scripted sequence of errors, then succeeds.
#[derive(Debug)]
struct FlakyProbe {
    failures: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl ConnectivityProbe for FlakyProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> Result<(), ProbeFailure> {
        match self.failures.lock().pop_front() {
            Some(reason) => Err(ProbeFailure::new(reason)),
            None => Ok(()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn every_failure_kind_means_not_ready_yet() {
    let probe = FlakyProbe {
        failures: Mutex::new(VecDeque::from([
            "failed to lookup address information: Name or service not known",
            "connection reset by peer",
            "connection refused",
        ])),
    };
    let gate = ReadinessGate::new(Arc::new(probe));

    let check = gate.await_ready(&target(), SEC, 5 * SEC).await.unwrap();
    assert_eq!(check.attempts(), 4);
    assert_eq!(check.state(), ReadinessState::Ready);
}

#[tokio::test(start_paused = true)]
async fn termination_interrupts_the_sleep() {
    let cancel = Arc::new(CancellationToken::new());
    let gate = ReadinessGate::new(Arc::new(ScriptedProbe::never())).with_cancellation(cancel.clone());
    let start = Instant::now();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.cancel("SIGTERM");
    });

    let err = gate.await_ready(&target(), 10 * SEC, 60 * SEC).await.unwrap_err();
    assert!(matches!(err, ReadinessError::Cancelled { ref reason, .. } if reason == "SIGTERM"));
    assert_eq!(start.elapsed(), Duration::from_millis(250));
}

#[tokio::test]
async fn zero_budget_is_rejected() {
    let gate = ReadinessGate::new(Arc::new(ScriptedProbe::always()));
    assert!(matches!(
        gate.await_ready(&target(), SEC, Duration::ZERO).await,
        Err(ReadinessError::InvalidPolicy(_))
    ));
}
