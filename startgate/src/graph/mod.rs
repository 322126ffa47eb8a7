//! Build stage graph.
//!
//! This module provides:
//! - Typed stage definitions with declared inputs and outputs
//! - Validation (acyclic, inputs satisfied) before any build step runs
//! - Concurrent, cache-aware execution into an artifact store
//! - Image composition with strict stage isolation

mod builder;
mod dag;
mod digest;
mod executor;
mod family;
mod images;
mod spec;

pub use builder::BuildGraphBuilder;
pub use dag::{resolve, BuildGraph, BuildOutcome, StageBuild};
pub use digest::{artifact_digest, stage_digest};
pub use executor::{
    InheritedArtifact, ManifestExecutor, ResolvedImport, ShellExecutor, StageExecutor, StageInvocation,
};
pub use family::service_image_family;
pub use images::{EntryOrigin, ImageEntry, ImageManifest};
pub use spec::{
    ArtifactImport, ArtifactOutput, BaseImage, BuildGraphDefinition, BuildOperation, BuildStage,
};
