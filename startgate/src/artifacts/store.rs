//! Artifact store trait and the in-memory implementation.

use crate::core::{Artifact, ArtifactKey, Digest};
use crate::errors::GraphError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of registering an artifact.
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// The artifact was new and has been stored.
    Inserted(Artifact),
    /// An identical artifact was already stored; the stored one is returned.
    Existing(Artifact),
}

impl PutOutcome {
    /// The artifact now held by the store.
    #[must_use]
    pub fn artifact(&self) -> &Artifact {
        match self {
            Self::Inserted(a) | Self::Existing(a) => a,
        }
    }

    /// Returns true if the store already held this artifact.
    #[must_use]
    pub fn was_cached(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Storage backend for build artifacts.
///
/// Stores are append-only per `(stage, name, digest)`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Looks up an artifact version.
    async fn get(&self, key: &ArtifactKey, digest: &Digest) -> Option<Artifact>;

    /// Registers an artifact.
    ///
    /// If an entry with the same key and digest exists, its content must match:
    /// otherwise the build is not reproducible and
    /// [`GraphError::Reproducibility`] is returned.
    async fn put(&self, artifact: Artifact) -> Result<PutOutcome, GraphError>;

    /// All stored versions of an artifact, oldest first.
    async fn versions(&self, key: &ArtifactKey) -> Vec<Artifact>;

    /// The most recently registered version of an artifact.
    async fn latest(&self, key: &ArtifactKey) -> Option<Artifact> {
        self.versions(key).await.pop()
    }

    /// Total number of stored artifact versions.
    fn len(&self) -> usize;

    /// Returns true if nothing has been stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct StoredArtifact {
    artifact: Artifact,
    sequence: u64,
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: DashMap<(ArtifactKey, Digest), StoredArtifact>,
    sequence: AtomicU64,
}

impl InMemoryArtifactStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn get(&self, key: &ArtifactKey, digest: &Digest) -> Option<Artifact> {
        self.entries
            .get(&(key.clone(), digest.clone()))
            .map(|entry| entry.artifact.clone())
    }

    async fn put(&self, artifact: Artifact) -> Result<PutOutcome, GraphError> {
        match self.entries.entry((artifact.key.clone(), artifact.digest.clone())) {
            Entry::Occupied(existing) => {
                let stored = &existing.get().artifact;
                if stored.content_digest == artifact.content_digest {
                    Ok(PutOutcome::Existing(stored.clone()))
                } else {
                    Err(GraphError::Reproducibility {
                        stage: artifact.key.stage.clone(),
                        artifact: artifact.key.name.clone(),
                        digest: artifact.digest.to_string(),
                        expected: stored.content_digest.to_string(),
                        actual: artifact.content_digest.to_string(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                slot.insert(StoredArtifact {
                    artifact: artifact.clone(),
                    sequence,
                });
                Ok(PutOutcome::Inserted(artifact))
            }
        }
    }

    async fn versions(&self, key: &ArtifactKey) -> Vec<Artifact> {
        let mut found: Vec<(u64, Artifact)> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().0 == key)
            .map(|entry| (entry.sequence, entry.artifact.clone()))
            .collect();
        found.sort_by_key(|(sequence, _)| *sequence);
        found.into_iter().map(|(_, artifact)| artifact).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
