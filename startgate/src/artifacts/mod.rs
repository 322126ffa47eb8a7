//! Artifact storage.
//!
//! Build outputs are registered under `(stage, name, digest)` and never
//! mutated afterwards. A rebuild either lands on an existing entry (cache hit)
//! or adds a new, independent version.

mod store;

pub use store::{ArtifactStore, InMemoryArtifactStore, PutOutcome};
