//! Core domain model types for startgate.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Artifacts, their identities and digests
//! - Readiness, health, stage and startup-step status enums

mod artifact;
mod status;

pub use artifact::{Artifact, ArtifactKey, ArtifactPayload, ArtifactRef, Digest};
pub use status::{
    HealthState, PrivilegeLevel, ReadinessState, StageStatus, StartupStep, EXIT_CANCELLED,
    EXIT_CONFIG, EXIT_PRIVILEGE_DENIED,
};
