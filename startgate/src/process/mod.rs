//! Process plumbing: short-lived commands and the server handoff.

mod executor;
mod launcher;

#[cfg(test)]
pub use executor::MockCommandExecutor;
pub use executor::{CommandExecutor, ExecOutput, ExecRequest, ProcessExecutor, SAFE_PATH};
pub use launcher::{LaunchMode, LaunchOutcome, LaunchSpec, ProcessLauncher, SystemLauncher};
