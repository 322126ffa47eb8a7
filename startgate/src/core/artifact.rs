//! Artifact types passed between build stages.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of an artifact: the producing stage and its logical name,
/// e.g. `(builder, venv)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The stage that produced the artifact.
    pub stage: String,
    /// The logical artifact name within that stage.
    pub name: String,
}

impl ArtifactKey {
    /// Creates a new artifact key.
    #[must_use]
    pub fn new(stage: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.name)
    }
}

/// A hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Hashes raw bytes.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Wraps an already computed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Filesystem payload of an artifact: relative path to file contents.
///
/// Paths are kept sorted so the content digest does not depend on the
/// order in which an executor collected files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactPayload {
    files: BTreeMap<String, Vec<u8>>,
}

impl ArtifactPayload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, replacing any previous contents at the same path.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Adds a file in place.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Iterates files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    /// Contents of one file.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if the payload holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of file sizes in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Digest over every `(path, contents)` pair.
    ///
    /// Each path and body is length-prefixed so that moving bytes between a
    /// path and its contents changes the digest.
    #[must_use]
    pub fn content_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        for (path, contents) in &self.files {
            hasher.update((path.len() as u64).to_be_bytes());
            hasher.update(path.as_bytes());
            hasher.update((contents.len() as u64).to_be_bytes());
            hasher.update(contents);
        }
        Digest(hex::encode(hasher.finalize()))
    }
}

/// Lightweight, serializable reference to an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact identity.
    #[serde(flatten)]
    pub key: ArtifactKey,
    /// Input-addressed digest (cache key).
    pub digest: Digest,
    /// Digest of the payload bytes.
    pub content_digest: Digest,
}

/// An immutable build output.
///
/// Cloning an artifact hands out a read-only logical copy; the payload
/// itself is shared.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Artifact identity.
    pub key: ArtifactKey,
    /// Input-addressed digest: a pure function of the producing stage's
    /// operations and its input artifacts.
    pub digest: Digest,
    /// Digest of the payload bytes.
    pub content_digest: Digest,
    /// The files.
    pub payload: Arc<ArtifactPayload>,
    /// The build run that first produced this version.
    pub build_id: Uuid,
    /// When this version was produced (ISO 8601).
    pub created_at: String,
}

impl Artifact {
    /// Creates an artifact, computing its content digest.
    #[must_use]
    pub fn new(key: ArtifactKey, digest: Digest, payload: ArtifactPayload, build_id: Uuid) -> Self {
        let content_digest = payload.content_digest();
        Self {
            key,
            digest,
            content_digest,
            payload: Arc::new(payload),
            build_id,
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Returns a serializable reference.
    #[must_use]
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            key: self.key.clone(),
            digest: self.digest.clone(),
            content_digest: self.content_digest.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_display() {
        let key = ArtifactKey::new("builder", "venv");
        assert_eq!(key.to_string(), "builder/venv");
    }

    #[test]
    fn test_content_digest_ignores_insertion_order() {
        let a = ArtifactPayload::new()
            .with_file("bin/python", b"elf".to_vec())
            .with_file("lib/site.py", b"import os".to_vec());
        let b = ArtifactPayload::new()
            .with_file("lib/site.py", b"import os".to_vec())
            .with_file("bin/python", b"elf".to_vec());

        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn test_content_digest_separates_path_and_contents() {
        let a = ArtifactPayload::new().with_file("ab", b"c".to_vec());
        let b = ArtifactPayload::new().with_file("a", b"bc".to_vec());
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn test_artifact_clone_shares_payload() {
        let artifact = Artifact::new(
            ArtifactKey::new("builder", "translations"),
            Digest::of_bytes(b"inputs"),
            ArtifactPayload::new().with_file("de/LC_MESSAGES/linotp.mo", vec![0xde, 0x12]),
            Uuid::nil(),
        );
        let copy = artifact.clone();

        assert!(Arc::ptr_eq(&artifact.payload, &copy.payload));
        assert_eq!(copy.reference().key.name, "translations");
    }

    #[test]
    fn test_digest_display() {
        let digest = Digest::of_bytes(b"");
        assert!(digest.to_string().starts_with("sha256:e3b0c44298fc"));
        assert_eq!(digest.short(), "e3b0c44298fc");
    }
}
