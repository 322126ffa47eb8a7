//! Error types for startgate.
//!
//! Four families of failure exist: build-graph integrity, dependency
//! unavailability, privilege denial and provisioning failure. Each fatal
//! condition names the stage or startup step it came from.

use crate::core::{StartupStep, EXIT_CANCELLED, EXIT_CONFIG, EXIT_PRIVILEGE_DENIED};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for startgate operations.
#[derive(Debug, Error)]
pub enum StartgateError {
    /// Build graph validation or execution failed.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The readiness gate did not reach `Ready`.
    #[error("{0}")]
    Readiness(#[from] ReadinessError),

    /// The privilege gate rejected or failed a command.
    #[error("{0}")]
    Privilege(#[from] PrivilegeError),

    /// Configuration is missing or invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A bootstrap action failed.
    #[error("{0}")]
    Bootstrap(#[from] BootstrapError),

    /// Startup was aborted by an external signal.
    #[error("Startup cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StartgateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Diagnostic metadata attached to graph errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when the stage graph contains a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cycle detected in build graph: {}", .cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle; first and last entries are equal.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

/// Error raised when a stage imports an artifact its source stage does not produce.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' imports artifact '{artifact}' from '{from_stage}', which does not produce it")]
pub struct MissingInputError {
    /// The importing stage.
    pub stage: String,
    /// The stage named as the source.
    pub from_stage: String,
    /// The missing artifact name.
    pub artifact: String,
}

impl MissingInputError {
    /// Creates a new missing input error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        from_stage: impl Into<String>,
        artifact: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            from_stage: from_stage.into(),
            artifact: artifact.into(),
        }
    }
}

/// Build-graph integrity and execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The declared dependencies form a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// An import names an artifact its source stage does not declare.
    #[error("{0}")]
    MissingInput(#[from] MissingInputError),

    /// A base or import refers to a stage that is not in the graph.
    #[error("Stage '{stage}' references unknown stage '{reference}'")]
    UnknownStage {
        /// The referring stage.
        stage: String,
        /// The missing stage name.
        reference: String,
    },

    /// Two stages share a name.
    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    /// A stage declares the same output twice.
    #[error("Stage '{stage}' declares output '{artifact}' more than once")]
    DuplicateOutput {
        /// The stage.
        stage: String,
        /// The duplicated artifact name.
        artifact: String,
    },

    /// A stage definition is malformed.
    #[error("Invalid stage '{stage}': {reason}")]
    InvalidStage {
        /// The stage.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The graph has no stages.
    #[error("Build graph has no stages")]
    Empty,

    /// A rebuild with identical inputs produced different bytes.
    #[error(
        "Stage '{stage}' is not reproducible: artifact '{artifact}' at {digest} \
         has content {expected}, rebuild produced {actual}"
    )]
    Reproducibility {
        /// The producing stage.
        stage: String,
        /// The artifact name.
        artifact: String,
        /// The input-addressed digest both builds share.
        digest: String,
        /// Content digest already stored.
        expected: String,
        /// Content digest of the rebuild.
        actual: String,
    },

    /// The stage executor failed.
    #[error("Stage '{stage}' failed: {reason}")]
    Execution {
        /// The stage.
        stage: String,
        /// The failure reason.
        reason: String,
    },

    /// The build was cancelled.
    #[error("Build cancelled: {0}")]
    Cancelled(String),
}

impl GraphError {
    /// Creates an execution error.
    #[must_use]
    pub fn execution(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Stable code and fix hint for this error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::CycleDetected(err) => ErrorInfo::new("GRAPH-001-CYCLE", self.to_string())
                .with_fix_hint("Remove a base or import reference to break the cycle.")
                .with_context_entry("cycle", err.cycle_path.join(" -> ")),
            Self::MissingInput(err) => ErrorInfo::new("GRAPH-002-MISSING_INPUT", self.to_string())
                .with_fix_hint("Declare the artifact as an output of the source stage or fix the import.")
                .with_context_entry("stage", err.stage.clone())
                .with_context_entry("from_stage", err.from_stage.clone()),
            Self::UnknownStage { stage, reference } => {
                ErrorInfo::new("GRAPH-003-UNKNOWN_STAGE", self.to_string())
                    .with_fix_hint("Check the stage name for typos.")
                    .with_context_entry("stage", stage.clone())
                    .with_context_entry("reference", reference.clone())
            }
            Self::DuplicateStage(stage) => ErrorInfo::new("GRAPH-004-DUPLICATE", self.to_string())
                .with_fix_hint("Stage names must be unique within a graph.")
                .with_context_entry("stage", stage.clone()),
            Self::DuplicateOutput { stage, .. } | Self::InvalidStage { stage, .. } => {
                ErrorInfo::new("GRAPH-005-INVALID_STAGE", self.to_string())
                    .with_context_entry("stage", stage.clone())
            }
            Self::Empty => ErrorInfo::new("GRAPH-006-EMPTY", self.to_string())
                .with_fix_hint("Add at least one stage before building."),
            Self::Reproducibility { stage, .. } => {
                ErrorInfo::new("GRAPH-007-REPRODUCIBILITY", self.to_string())
                    .with_fix_hint("Remove timestamps or other nondeterminism from the stage's operations.")
                    .with_context_entry("stage", stage.clone())
            }
            Self::Execution { stage, .. } => ErrorInfo::new("GRAPH-008-EXECUTION", self.to_string())
                .with_context_entry("stage", stage.clone()),
            Self::Cancelled(_) => ErrorInfo::new("GRAPH-009-CANCELLED", self.to_string()),
        }
    }
}

/// Errors from the readiness gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadinessError {
    /// The timeout budget ran out before a probe succeeded.
    #[error(
        "Dependency {target} unreachable after {elapsed:?} ({attempts} attempts, timeout {timeout:?}): {last_error}"
    )]
    TimedOut {
        /// Redacted target description.
        target: String,
        /// Time spent polling.
        elapsed: Duration,
        /// The configured budget.
        timeout: Duration,
        /// Probe attempts made.
        attempts: u32,
        /// The last probe failure.
        last_error: String,
    },

    /// An external abort signal interrupted polling.
    #[error("Readiness wait for {target} aborted after {elapsed:?}: {reason}")]
    Cancelled {
        /// Redacted target description.
        target: String,
        /// Time spent polling.
        elapsed: Duration,
        /// Cancellation reason.
        reason: String,
    },

    /// The target could not be derived from configuration.
    #[error("Invalid readiness target '{target}': {reason}")]
    InvalidTarget {
        /// The offending (redacted) value.
        target: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Poll parameters are unusable.
    #[error("Invalid readiness policy: {0}")]
    InvalidPolicy(String),
}

/// Errors from the privilege transition gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrivilegeError {
    /// No allow-list rule matches the request.
    #[error("Permission denied: '{invoker}' may not run '{command}' as '{target}'")]
    PermissionDenied {
        /// The calling identity.
        invoker: String,
        /// The requested identity.
        target: String,
        /// The rendered command line.
        command: String,
    },

    /// A rule would allow a command that itself grants elevation.
    #[error("Rule for '{program}' rejected: elevation tools cannot be allow-listed")]
    ElevationRule {
        /// The rejected program.
        program: String,
    },

    /// A rule's argument pattern does not compile.
    #[error("Invalid argument pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern.
        pattern: String,
        /// Compilation error.
        reason: String,
    },

    /// The command could not be started.
    #[error("Command '{command}' could not be run: {reason}")]
    Execution {
        /// The rendered command line.
        command: String,
        /// Why it failed.
        reason: String,
    },

    /// The command ran and exited unsuccessfully.
    #[error("Command '{command}' exited with status {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    NonZeroExit {
        /// The rendered command line.
        command: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },
}

impl PrivilegeError {
    /// True for allow-list rejections (as opposed to execution failures).
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::ElevationRule { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing required setting {0}")]
    Missing(String),

    /// A setting has an unusable value.
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// The environment variable.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from bootstrap actions and the server handoff.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// An action failed for a domain reason.
    #[error("{action}: {reason}")]
    Action {
        /// The action name.
        action: String,
        /// Why it failed.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("{action}: {path}: {source}")]
    Io {
        /// The action name.
        action: String,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A command went through the privilege gate and failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// The service identity does not exist on this system.
    #[error("Unknown service user '{0}'")]
    UnknownUser(String),

    /// The server process could not be started.
    #[error("Server handoff failed: {0}")]
    Handoff(String),
}

impl BootstrapError {
    /// Creates an action error.
    #[must_use]
    pub fn action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error bound to a path.
    #[must_use]
    pub fn io(action: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            path: path.into(),
            source,
        }
    }
}

/// A failed startup sequence: which step failed and why.
#[derive(Debug, Error)]
#[error("Startup step '{step}' failed: {source}")]
pub struct StartupFailure {
    /// The failing step.
    pub step: StartupStep,
    /// The underlying error.
    #[source]
    pub source: StartgateError,
}

impl StartupFailure {
    /// Creates a startup failure.
    #[must_use]
    pub fn new(step: StartupStep, source: impl Into<StartgateError>) -> Self {
        Self {
            step,
            source: source.into(),
        }
    }

    /// Process exit code for this failure.
    ///
    /// Cancellation, privilege denials and configuration errors have their
    /// own codes regardless of the step they interrupted.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match &self.source {
            StartgateError::Cancelled(_)
            | StartgateError::Readiness(ReadinessError::Cancelled { .. }) => EXIT_CANCELLED,
            StartgateError::Privilege(err)
            | StartgateError::Bootstrap(BootstrapError::Privilege(err))
                if err.is_denial() =>
            {
                EXIT_PRIVILEGE_DENIED
            }
            StartgateError::Config(_) => EXIT_CONFIG,
            _ => self.step.exit_code(),
        }
    }
}
