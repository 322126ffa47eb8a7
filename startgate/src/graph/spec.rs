//! Build stage and graph definitions.

use crate::errors::{CycleDetectedError, GraphError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path};

/// What a stage builds on top of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseImage {
    /// A published image, e.g. `debian:bookworm-slim`.
    Public {
        /// Image reference.
        reference: String,
    },
    /// The image produced by another stage.
    Stage {
        /// Name of the base stage.
        stage: String,
    },
}

impl BaseImage {
    /// A published base image.
    #[must_use]
    pub fn public(reference: impl Into<String>) -> Self {
        Self::Public {
            reference: reference.into(),
        }
    }

    /// Another stage's image.
    #[must_use]
    pub fn stage(stage: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
        }
    }

    /// The base stage name, if the base is a stage.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::Stage { stage } => Some(stage),
            Self::Public { .. } => None,
        }
    }
}

/// One ordered build operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BuildOperation {
    /// Run a program. No shell is involved.
    Run {
        /// Program and arguments.
        argv: Vec<String>,
    },
    /// Set an environment variable for later operations.
    Env {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Change the working directory for later operations.
    Workdir {
        /// Directory path.
        path: String,
    },
    /// Switch the identity later operations run as.
    User {
        /// User name.
        name: String,
    },
    /// Write a file with fixed contents.
    WriteFile {
        /// File path.
        path: String,
        /// File contents.
        contents: String,
    },
}

impl BuildOperation {
    /// A `Run` operation from string slices.
    #[must_use]
    pub fn run(argv: &[&str]) -> Self {
        Self::Run {
            argv: argv.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// A named artifact a stage produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactOutput {
    /// Logical artifact name, unique within the stage.
    pub name: String,
    /// Where the artifact lives in the stage's filesystem.
    pub path: String,
}

/// An artifact copied in from a predecessor stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactImport {
    /// Producing stage.
    pub from: String,
    /// Logical artifact name in the producing stage.
    pub artifact: String,
    /// Destination path in the importing stage.
    pub dest: String,
}

/// A typed build stage: a base, ordered operations, declared outputs and
/// declared imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStage {
    /// Unique stage name.
    pub name: String,
    /// Base image.
    pub base: BaseImage,
    /// Ordered operations.
    #[serde(default)]
    pub operations: Vec<BuildOperation>,
    /// Artifacts this stage produces.
    #[serde(default)]
    pub outputs: Vec<ArtifactOutput>,
    /// Artifacts this stage copies in from predecessors.
    #[serde(default)]
    pub imports: Vec<ArtifactImport>,
}

impl BuildStage {
    /// Creates a stage with no operations, outputs or imports.
    #[must_use]
    pub fn new(name: impl Into<String>, base: BaseImage) -> Self {
        Self {
            name: name.into(),
            base,
            operations: Vec::new(),
            outputs: Vec::new(),
            imports: Vec::new(),
        }
    }

    /// Appends an operation.
    #[must_use]
    pub fn with_operation(mut self, operation: BuildOperation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Appends a `Run` operation.
    #[must_use]
    pub fn with_run(self, argv: &[&str]) -> Self {
        self.with_operation(BuildOperation::run(argv))
    }

    /// Declares an output artifact.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.push(ArtifactOutput {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Declares an imported artifact.
    #[must_use]
    pub fn with_import(
        mut self,
        from: impl Into<String>,
        artifact: impl Into<String>,
        dest: impl Into<String>,
    ) -> Self {
        self.imports.push(ArtifactImport {
            from: from.into(),
            artifact: artifact.into(),
            dest: dest.into(),
        });
        self
    }

    /// Stages this stage depends on: its base stage and every import source.
    #[must_use]
    pub fn predecessors(&self) -> BTreeSet<&str> {
        self.base
            .stage_name()
            .into_iter()
            .chain(self.imports.iter().map(|i| i.from.as_str()))
            .collect()
    }

    /// Returns the declared output with this name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&ArtifactOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank, the stage references itself,
    /// an output is declared twice, or a path escapes the stage root.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.name.trim().is_empty() {
            return Err(GraphError::InvalidStage {
                stage: self.name.clone(),
                reason: "stage name cannot be empty".to_string(),
            });
        }

        if self.predecessors().contains(self.name.as_str()) {
            return Err(CycleDetectedError::new(vec![self.name.clone(), self.name.clone()]).into());
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(GraphError::DuplicateOutput {
                    stage: self.name.clone(),
                    artifact: output.name.clone(),
                });
            }
            self.check_path(&output.path)?;
        }

        for import in &self.imports {
            self.check_path(&import.dest)?;
        }

        for operation in &self.operations {
            match operation {
                BuildOperation::Run { argv } if argv.is_empty() => {
                    return Err(GraphError::InvalidStage {
                        stage: self.name.clone(),
                        reason: "run operation has no program".to_string(),
                    });
                }
                BuildOperation::Workdir { path } | BuildOperation::WriteFile { path, .. } => {
                    self.check_path(path)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn check_path(&self, path: &str) -> Result<(), GraphError> {
        let escapes = Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if path.trim().is_empty() || escapes {
            return Err(GraphError::InvalidStage {
                stage: self.name.clone(),
                reason: format!("invalid path '{path}'"),
            });
        }
        Ok(())
    }
}

/// A complete, serializable graph definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildGraphDefinition {
    /// Graph name.
    pub name: String,
    /// Stages in declaration order.
    pub stages: Vec<BuildStage>,
}

impl BuildGraphDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: BuildStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&BuildStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Parses a definition from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the definition as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_predecessors_include_base_and_imports() {
        let stage = BuildStage::new("production", BaseImage::stage("base"))
            .with_import("builder", "venv", "/opt/venv")
            .with_import("builder", "translations", "/app/i18n")
            .with_import("ca-bundle", "ca-bundle", "/ca");

        let preds: Vec<&str> = stage.predecessors().into_iter().collect();
        assert_eq!(preds, vec!["base", "builder", "ca-bundle"]);
    }

    #[test]
    fn test_public_base_has_no_predecessor() {
        let stage = BuildStage::new("base", BaseImage::public("debian:bookworm-slim"));
        assert!(stage.predecessors().is_empty());
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let stage = BuildStage::new("loop", BaseImage::stage("loop"));
        assert!(matches!(stage.validate(), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let stage = BuildStage::new("builder", BaseImage::public("python:3.11"))
            .with_output("venv", "/opt/venv")
            .with_output("venv", "/opt/other");
        assert!(matches!(
            stage.validate(),
            Err(GraphError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_path_escape_rejected() {
        let stage = BuildStage::new("builder", BaseImage::public("python:3.11"))
            .with_output("venv", "../outside");
        assert!(matches!(
            stage.validate(),
            Err(GraphError::InvalidStage { .. })
        ));

        let empty_run = BuildStage::new("builder", BaseImage::public("python:3.11"))
            .with_operation(BuildOperation::Run { argv: vec![] });
        assert!(empty_run.validate().is_err());
    }

    #[test]
    fn test_definition_json() {
        let json = r#"{
            "name": "demo",
            "stages": [
                {"name": "base", "base": {"kind": "public", "reference": "debian:bookworm-slim"}},
                {
                    "name": "builder",
                    "base": {"kind": "stage", "stage": "base"},
                    "operations": [{"op": "run", "argv": ["make", "venv"]}],
                    "outputs": [{"name": "venv", "path": "/opt/venv"}]
                }
            ]
        }"#;

        let def = BuildGraphDefinition::from_json(json).unwrap();
        assert_eq!(def.stages.len(), 2);
        let builder = def.stage("builder").unwrap();
        assert_eq!(builder.base, BaseImage::stage("base"));
        assert_eq!(builder.operations, vec![BuildOperation::run(&["make", "venv"])]);

        let again = BuildGraphDefinition::from_json(&def.to_json().unwrap()).unwrap();
        assert_eq!(again, def);
    }
}
