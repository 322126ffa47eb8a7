//! Handing control to the server process.
//!
//! By default the orchestrator's process image is replaced (`exec`), so the
//! server becomes the container's main process and receives its signals
//! directly. Where that is not wanted, the server is spawned and supervised,
//! with termination and control signals forwarded to it.

use crate::errors::BootstrapError;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// How the server is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Replace the current process image.
    #[default]
    Exec,
    /// Spawn, forward signals, and wait.
    Supervise,
}

/// The server command and the identity it runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program path or name.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Complete environment of the server.
    pub env: BTreeMap<String, String>,
    /// Target uid; `None` keeps the current identity.
    pub uid: Option<u32>,
    /// Target gid; `None` keeps the current identity.
    pub gid: Option<u32>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Exec or supervise.
    pub mode: LaunchMode,
}

impl LaunchSpec {
    /// Splits a command line on whitespace into a spec.
    ///
    /// Returns `None` for an empty command.
    #[must_use]
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            env: BTreeMap::new(),
            uid: None,
            gid: None,
            cwd: None,
            mode: LaunchMode::Exec,
        })
    }

    /// Renders the command line.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a launch that returned control to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The process image was handed over. Only test launchers return this;
    /// a real exec never returns on success.
    HandedOff,
    /// A supervised server exited with this code (128 + n for signal n).
    Exited(i32),
}

/// Starts the server.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launches `spec`.
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome, BootstrapError>;
}

/// Launcher backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

const FORWARDED: [(SignalKind, Signal); 6] = [
    (SignalKind::terminate(), Signal::SIGTERM),
    (SignalKind::interrupt(), Signal::SIGINT),
    (SignalKind::hangup(), Signal::SIGHUP),
    (SignalKind::quit(), Signal::SIGQUIT),
    (SignalKind::user_defined1(), Signal::SIGUSR1),
    (SignalKind::user_defined2(), Signal::SIGUSR2),
];

impl SystemLauncher {
    fn exec(spec: &LaunchSpec) -> BootstrapError {
        let mut cmd = std::process::Command::new(&spec.program);
        cmd.args(&spec.args).env_clear().envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }

        info!(command = %spec.command_line(), uid = ?spec.uid, "Replacing process with server");
        let err = cmd.exec();
        BootstrapError::Handoff(format!("exec {}: {err}", spec.program))
    }

    async fn supervise(spec: &LaunchSpec) -> Result<LaunchOutcome, BootstrapError> {
        let mut streams = Vec::with_capacity(FORWARDED.len());
        for (kind, sig) in FORWARDED {
            let stream = signal(kind).map_err(|e| BootstrapError::Handoff(format!("signal setup: {e}")))?;
            streams.push((stream, sig));
        }

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args).env_clear().envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BootstrapError::Handoff(format!("spawn {}: {e}", spec.program)))?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| BootstrapError::Handoff("server exited before supervision began".to_string()))?;
        info!(command = %spec.command_line(), pid = %pid, "Supervising server");

        loop {
            let received = futures::future::select_all(
                streams
                    .iter_mut()
                    .map(|(stream, sig)| Box::pin(async move { stream.recv().await.map(|()| *sig) })),
            );

            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| BootstrapError::Handoff(format!("wait: {e}")))?;
                    let code = status
                        .code()
                        .or_else(|| status.signal().map(|s| 128 + s))
                        .unwrap_or(1);
                    info!(pid = %pid, code, "Server exited");
                    return Ok(LaunchOutcome::Exited(code));
                }
                (sig, _, _) = received => {
                    let Some(sig) = sig else { continue };
                    debug!(signal = ?sig, pid = %pid, "Forwarding signal to server");
                    if let Err(e) = kill(pid, sig) {
                        warn!(signal = ?sig, pid = %pid, error = %e, "Failed to forward signal");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome, BootstrapError> {
        match spec.mode {
            LaunchMode::Exec => Err(Self::exec(&spec)),
            LaunchMode::Supervise => Self::supervise(&spec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line() {
        let spec = LaunchSpec::from_command_line("  linotp run --host 0.0.0.0 ").unwrap();
        assert_eq!(spec.program, "linotp");
        assert_eq!(spec.args, vec!["run", "--host", "0.0.0.0"]);
        assert_eq!(spec.command_line(), "linotp run --host 0.0.0.0");
        assert!(LaunchSpec::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_exec_failure_is_reported() {
        let mut spec = LaunchSpec::from_command_line("/nonexistent/linotp-server").unwrap();
        spec.mode = LaunchMode::Exec;
        let err = SystemLauncher.launch(spec).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Handoff(_)));
    }

    #[tokio::test]
    async fn test_supervised_exit_code() {
        let mut spec = LaunchSpec::from_command_line("sh").unwrap();
        spec.args = vec!["-c".into(), "exit 3".into()];
        spec.env.insert("PATH".into(), crate::process::SAFE_PATH.into());
        spec.mode = LaunchMode::Supervise;

        let outcome = SystemLauncher.launch(spec).await.unwrap();
        assert_eq!(outcome, LaunchOutcome::Exited(3));
    }
}
