//! # Startgate
//!
//! Container startup orchestration for a self-hosted authentication service,
//! together with the build-stage graph that produces its family of images.
//!
//! Startgate covers two halves of the same problem:
//!
//! - **Build stage graph**: typed build stages with declared inputs and outputs,
//!   validated (acyclic, inputs satisfied) before anything is built, producing
//!   immutable, content-addressed artifacts
//! - **Readiness gate**: bounded polling of the primary data dependency
//! - **Bootstrap orchestrator**: idempotent provisioning in a fixed order, then
//!   a handoff to the server under the unprivileged service identity
//! - **Privilege transition gate**: a closed allow-list of root operations
//! - **Health probe**: consecutive-failure classification of the running server
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use startgate::prelude::*;
//!
//! let config = StartupConfig::from_env(DEFAULT_ENV_PREFIX)?;
//! let orchestrator = BootstrapOrchestrator::for_config(Arc::new(config))?;
//! let outcome = orchestrator
//!     .run_startup_sequence(StartupFlags { with_bootstrap: true })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod bootstrap;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod health;
pub mod observability;
pub mod privilege;
pub mod process;
pub mod readiness;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactStore, InMemoryArtifactStore};
    pub use crate::bootstrap::{
        BootstrapAction, BootstrapContext, BootstrapOrchestrator, IdentityResolver,
        ServiceIdentity, StartupFlags, SystemIdentities,
    };
    pub use crate::cancellation::{cancel_on_termination, CancellationToken};
    pub use crate::config::{StartupConfig, DEFAULT_ENV_PREFIX};
    pub use crate::core::{
        Artifact, ArtifactKey, ArtifactPayload, ArtifactRef, Digest, HealthState,
        PrivilegeLevel, ReadinessState, StartupStep,
    };
    pub use crate::errors::{
        BootstrapError, ConfigError, CycleDetectedError, GraphError, MissingInputError,
        PrivilegeError, ReadinessError, StartgateError, StartupFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{
        resolve, service_image_family, BuildGraph, BuildGraphBuilder, BuildGraphDefinition,
        BuildStage, ImageManifest, ManifestExecutor, StageExecutor,
    };
    pub use crate::health::{HealthChecker, HealthMonitor, HealthPolicy, HealthProbe};
    pub use crate::privilege::{AllowList, PrivilegeGate, PrivilegeRule, PrivilegedCommand};
    pub use crate::process::{
        CommandExecutor, LaunchOutcome, LaunchSpec, ProcessExecutor, ProcessLauncher,
        SystemLauncher,
    };
    pub use crate::readiness::{
        ConnectivityProbe, PollPolicy, ReadinessGate, ReadinessTarget, TcpProbe,
    };
}
