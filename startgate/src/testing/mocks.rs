//! Test doubles for the injectable seams of the startup path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::bootstrap::{IdentityResolver, ServiceIdentity};
use crate::errors::BootstrapError;
use crate::health::{CheckFailure, HealthChecker};
use crate::process::{CommandExecutor, ExecOutput, ExecRequest, LaunchOutcome, LaunchSpec, ProcessLauncher};
use crate::readiness::{ConnectivityProbe, Endpoint, ProbeFailure};

/// Records every command and answers from a table keyed by command line.
///
/// Commands without a scripted answer succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    requests: Mutex<Vec<ExecRequest>>,
    responses: Mutex<HashMap<String, ExecOutput>>,
}

impl RecordingExecutor {
    /// Creates an executor where everything succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the answer for `command_line` (program and args joined by spaces).
    pub fn respond(&self, command_line: impl Into<String>, output: ExecOutput) {
        self.responses.lock().insert(command_line.into(), output);
    }

    /// Every request, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().clone()
    }

    /// Every command line, in order.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.requests.lock().iter().map(ToString::to_string).collect()
    }

    /// Number of commands run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns true if nothing ran.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Forgets recorded requests.
    pub fn reset(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, request: &ExecRequest) -> std::io::Result<ExecOutput> {
        self.requests.lock().push(request.clone());
        Ok(self
            .responses
            .lock()
            .get(&request.to_string())
            .cloned()
            .unwrap_or_else(|| ExecOutput::ok("")))
    }
}

/// Fixed identities instead of the system user database.
#[derive(Debug, Clone)]
pub struct StaticIdentities {
    current: ServiceIdentity,
    users: HashMap<String, ServiceIdentity>,
}

impl StaticIdentities {
    /// The process runs as `current`, which is also known by name.
    #[must_use]
    pub fn new(current: ServiceIdentity) -> Self {
        let mut users = HashMap::new();
        users.insert(current.name.clone(), current.clone());
        Self { current, users }
    }

    /// Adds a known account.
    #[must_use]
    pub fn with_user(mut self, user: ServiceIdentity) -> Self {
        self.users.insert(user.name.clone(), user);
        self
    }
}

impl IdentityResolver for StaticIdentities {
    fn current(&self) -> Result<ServiceIdentity, BootstrapError> {
        Ok(self.current.clone())
    }

    fn lookup(&self, name: &str) -> Result<ServiceIdentity, BootstrapError> {
        self.users
            .get(name)
            .cloned()
            .ok_or_else(|| BootstrapError::UnknownUser(name.to_string()))
    }
}

/// Records launches instead of starting anything.
#[derive(Debug)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<LaunchSpec>>,
    outcome: Result<LaunchOutcome, String>,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLauncher {
    /// Every launch "hands off" successfully.
    #[must_use]
    pub fn new() -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            outcome: Ok(LaunchOutcome::HandedOff),
        }
    }

    /// Every launch reports a supervised exit with `code`.
    #[must_use]
    pub fn exiting(code: i32) -> Self {
        Self {
            outcome: Ok(LaunchOutcome::Exited(code)),
            ..Self::new()
        }
    }

    /// Every launch fails.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            outcome: Err(reason.into()),
            ..Self::new()
        }
    }

    /// Every launch, in order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome, BootstrapError> {
        self.launches.lock().push(spec);
        self.outcome.clone().map_err(BootstrapError::Handoff)
    }
}

/// A connectivity probe that becomes reachable at a fixed (tokio) time.
#[derive(Debug)]
pub struct ScriptedProbe {
    ready_at: Option<Instant>,
    delay: Option<Duration>,
    attempts: AtomicU32,
    probe_time: Duration,
}

impl ScriptedProbe {
    /// Reachable `delay` after creation.
    #[must_use]
    pub fn reachable_after(delay: Duration) -> Self {
        Self {
            ready_at: Some(Instant::now() + delay),
            delay: Some(delay),
            attempts: AtomicU32::new(0),
            probe_time: Duration::ZERO,
        }
    }

    /// Reachable right away.
    #[must_use]
    pub fn always() -> Self {
        Self::reachable_after(Duration::ZERO)
    }

    /// Never reachable.
    #[must_use]
    pub fn never() -> Self {
        Self {
            ready_at: None,
            delay: None,
            attempts: AtomicU32::new(0),
            probe_time: Duration::ZERO,
        }
    }

    /// Each probe takes this long before answering.
    #[must_use]
    pub fn with_probe_time(mut self, probe_time: Duration) -> Self {
        self.probe_time = probe_time;
        self
    }

    /// Number of probes made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.probe_time.is_zero() {
            tokio::time::sleep(self.probe_time).await;
        }
        match self.ready_at {
            Some(at) if Instant::now() >= at => Ok(()),
            Some(_) => Err(ProbeFailure::new(format!(
                "{endpoint}: connection refused (reachable after {:?})",
                self.delay.unwrap_or_default()
            ))),
            None => Err(ProbeFailure::new(format!("{endpoint}: connection refused"))),
        }
    }
}

/// A health checker that replays scripted results, repeating the last one.
#[derive(Debug)]
pub struct ScriptedHealthChecker {
    results: Mutex<VecDeque<Result<(), CheckFailure>>>,
    last: Mutex<Result<(), CheckFailure>>,
    calls: AtomicU32,
}

impl ScriptedHealthChecker {
    /// Replays `results`; once exhausted the last result repeats.
    #[must_use]
    pub fn new(results: impl IntoIterator<Item = Result<(), CheckFailure>>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            last: Mutex::new(Ok(())),
            calls: AtomicU32::new(0),
        }
    }

    /// Replays HTTP status codes: 200 passes, anything else fails.
    #[must_use]
    pub fn from_statuses(statuses: &[u16]) -> Self {
        Self::new(statuses.iter().map(|&status| {
            if status == 200 {
                Ok(())
            } else {
                Err(CheckFailure::new(format!("status {status}")))
            }
        }))
    }

    /// Number of checks made.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthChecker for ScriptedHealthChecker {
    async fn check(&self) -> Result<(), CheckFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().pop_front();
        match next {
            Some(result) => {
                *self.last.lock() = result.clone();
                result
            }
            None => self.last.lock().clone(),
        }
    }
}
