//! Running short-lived commands.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// PATH handed to every command; the caller's PATH is never inherited.
pub const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A command to run: no shell, explicit environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    /// Program path or name.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment. Nothing else is inherited apart from `PATH`.
    pub env: BTreeMap<String, String>,
    /// Run as this uid.
    pub uid: Option<u32>,
    /// Run as this gid.
    pub gid: Option<u32>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl ExecRequest {
    /// Creates a request for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Runs the command as `uid`/`gid`.
    #[must_use]
    pub fn as_identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful run with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true for exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands. Injectable so that privileged paths are testable without root.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `request` to completion.
    async fn run(&self, request: &ExecRequest) -> std::io::Result<ExecOutput>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, request: &ExecRequest) -> std::io::Result<ExecOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(gid) = request.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = request.uid {
            cmd.uid(uid);
        }

        let output = cmd.output().await?;
        Ok(ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_display() {
        let req = ExecRequest::new("linotp").with_args(["init", "database"]);
        assert_eq!(req.to_string(), "linotp init database");
    }

    #[tokio::test]
    async fn test_process_executor_scrubs_environment() {
        std::env::set_var("STARTGATE_TEST_LEAK", "leaked");
        let out = ProcessExecutor
            .run(&ExecRequest::new("env").with_env("KEPT", "yes"))
            .await
            .unwrap();

        assert!(out.success());
        assert!(out.stdout.contains("KEPT=yes"));
        assert!(out.stdout.contains(&format!("PATH={SAFE_PATH}")));
        assert!(!out.stdout.contains("STARTGATE_TEST_LEAK"));
    }

    #[tokio::test]
    async fn test_process_executor_reports_exit_code() {
        let out = ProcessExecutor.run(&ExecRequest::new("false")).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.code, Some(1));
    }
}
