//! Status enums shared across the build graph and the startup path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a single readiness check.
///
/// A check starts `Pending` and ends in exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    /// Still polling.
    #[default]
    Pending,
    /// The dependency accepted a connection.
    Ready,
    /// The timeout budget was exhausted.
    TimedOut,
}

impl ReadinessState {
    /// Returns true for `Ready` and `TimedOut`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::TimedOut)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Health classification of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No verdict yet (inside the start period or before the first probe).
    #[default]
    Starting,
    /// Serving.
    Healthy,
    /// Failure threshold reached.
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Privilege a bootstrap action needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeLevel {
    /// Must run as root (through the privilege gate for commands).
    Root,
    /// Runs as the unprivileged service identity.
    Service,
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Build status of a stage within one graph execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for predecessors.
    #[default]
    Pending,
    /// Executor is running.
    Running,
    /// Freshly built.
    Built,
    /// Every output was already in the artifact store.
    Cached,
    /// Execution failed.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Built => write!(f, "built"),
            Self::Cached => write!(f, "cached"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Exit code used when startup is aborted by a termination signal (128 + SIGTERM).
pub const EXIT_CANCELLED: i32 = 143;

/// Exit code for a rejected privileged command, whichever step issued it.
pub const EXIT_PRIVILEGE_DENIED: i32 = 15;

/// Exit code for invalid configuration or command-line usage.
pub const EXIT_CONFIG: i32 = 2;

/// The fixed steps of the startup sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStep {
    /// Install or refresh CA trust material.
    CaCertificates,
    /// Create the persisted directory layout.
    Layout,
    /// Link custom template and asset directories.
    Symlinks,
    /// Wait for the primary data dependency.
    Readiness,
    /// One-time provisioning (`--with-bootstrap`).
    Provisioning,
    /// Resolve and switch to the service identity.
    PrivilegeDrop,
    /// Replace (or supervise) the process with the server.
    Handoff,
}

impl StartupStep {
    /// All steps in their fixed order.
    pub const ALL: [Self; 7] = [
        Self::CaCertificates,
        Self::Layout,
        Self::Symlinks,
        Self::Readiness,
        Self::Provisioning,
        Self::PrivilegeDrop,
        Self::Handoff,
    ];

    /// Process exit code reported when this step fails.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::CaCertificates => 10,
            Self::Layout => 11,
            Self::Symlinks => 12,
            Self::Readiness => 13,
            Self::Provisioning => 14,
            Self::PrivilegeDrop => 16,
            Self::Handoff => 17,
        }
    }

    /// Stable name used in events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaCertificates => "ca_certificates",
            Self::Layout => "layout",
            Self::Symlinks => "symlinks",
            Self::Readiness => "readiness",
            Self::Provisioning => "provisioning",
            Self::PrivilegeDrop => "privilege_drop",
            Self::Handoff => "handoff",
        }
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_readiness_state_default_is_pending() {
        assert_eq!(ReadinessState::default(), ReadinessState::Pending);
        assert!(!ReadinessState::Pending.is_terminal());
        assert!(ReadinessState::Ready.is_terminal());
        assert!(ReadinessState::TimedOut.is_terminal());
    }

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let mut codes: HashSet<i32> = StartupStep::ALL.iter().map(|s| s.exit_code()).collect();
        assert_eq!(codes.len(), StartupStep::ALL.len());
        assert!(!codes.contains(&0));
        assert!(codes.insert(EXIT_PRIVILEGE_DENIED));
        assert!(codes.insert(EXIT_CANCELLED));
        assert!(codes.insert(EXIT_CONFIG));
    }

    #[test]
    fn test_steps_are_ordered() {
        let mut sorted = StartupStep::ALL;
        sorted.sort();
        assert_eq!(sorted, StartupStep::ALL);
        assert!(StartupStep::CaCertificates < StartupStep::Symlinks);
        assert!(StartupStep::Readiness < StartupStep::Provisioning);
    }

    #[test]
    fn test_step_serialization() {
        let json = serde_json::to_string(&StartupStep::PrivilegeDrop).unwrap();
        assert_eq!(json, "\"privilege_drop\"");
        assert_eq!(StartupStep::PrivilegeDrop.to_string(), "privilege_drop");
    }
}
