//! Image composition.
//!
//! A stage's image is its base image plus the artifacts it imports plus the
//! artifacts it produces. Nothing else crosses a stage boundary: an artifact
//! a predecessor merely imported is not visible to stages that import from
//! that predecessor.

use super::spec::{BaseImage, BuildStage};
use crate::core::ArtifactKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How an artifact ended up in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Built by the stage itself.
    Produced,
    /// Explicitly imported by the stage.
    Imported,
    /// Present in the base stage's image.
    Inherited {
        /// The stage in the base lineage that added it.
        from: String,
    },
}

/// One artifact placed in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// The artifact.
    pub artifact: ArtifactKey,
    /// Where it lives in the image.
    pub path: String,
    /// How it got there.
    pub origin: EntryOrigin,
}

/// The composed contents of a stage's final image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// The stage this image belongs to.
    pub stage: String,
    /// The published image at the root of the base lineage.
    pub root: String,
    /// Stage names from the root of the lineage down to this stage.
    pub lineage: Vec<String>,
    /// Artifacts in the image.
    pub entries: Vec<ImageEntry>,
}

impl ImageManifest {
    /// Returns true if the image holds this artifact.
    #[must_use]
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.entries.iter().any(|e| &e.artifact == key)
    }

    /// Artifact keys in the image, in placement order.
    #[must_use]
    pub fn artifacts(&self) -> Vec<&ArtifactKey> {
        self.entries.iter().map(|e| &e.artifact).collect()
    }
}

/// Composes the image of `stage`. Stages must already be validated.
pub(crate) fn compose(stages: &HashMap<String, BuildStage>, stage: &BuildStage) -> ImageManifest {
    let mut manifest = match &stage.base {
        BaseImage::Public { reference } => ImageManifest {
            stage: stage.name.clone(),
            root: reference.clone(),
            lineage: Vec::new(),
            entries: Vec::new(),
        },
        BaseImage::Stage { stage: base } => match stages.get(base) {
            Some(base_stage) => {
                let inherited = compose(stages, base_stage);
                ImageManifest {
                    stage: stage.name.clone(),
                    root: inherited.root,
                    lineage: inherited.lineage,
                    entries: inherited
                        .entries
                        .into_iter()
                        .map(|entry| ImageEntry {
                            origin: match entry.origin {
                                EntryOrigin::Inherited { from } => EntryOrigin::Inherited { from },
                                EntryOrigin::Produced | EntryOrigin::Imported => {
                                    EntryOrigin::Inherited { from: base.clone() }
                                }
                            },
                            ..entry
                        })
                        .collect(),
                }
            }
            None => ImageManifest {
                stage: stage.name.clone(),
                root: base.clone(),
                lineage: Vec::new(),
                entries: Vec::new(),
            },
        },
    };

    manifest.lineage.push(stage.name.clone());
    manifest
        .entries
        .extend(stage.imports.iter().map(|import| ImageEntry {
            artifact: ArtifactKey::new(&import.from, &import.artifact),
            path: import.dest.clone(),
            origin: EntryOrigin::Imported,
        }));
    manifest
        .entries
        .extend(stage.outputs.iter().map(|output| ImageEntry {
            artifact: ArtifactKey::new(&stage.name, &output.name),
            path: output.path.clone(),
            origin: EntryOrigin::Produced,
        }));
    manifest
}
