//! Stage executors: how a stage's operations turn into artifact payloads.

use super::spec::{ArtifactImport, BuildOperation, BuildStage};
use crate::core::{Artifact, ArtifactPayload, Digest};
use crate::errors::GraphError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An import resolved to the concrete artifact version it copies.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    /// The declaration.
    pub import: ArtifactImport,
    /// The artifact being copied (read-only).
    pub artifact: Artifact,
}

/// An artifact the stage's base image already contains, at the path it
/// occupies there.
#[derive(Debug, Clone)]
pub struct InheritedArtifact {
    /// Where the artifact sits in the base image.
    pub path: String,
    /// True when `path` is the producing stage's declared output path, false
    /// when the artifact was imported to `path` somewhere in the lineage.
    pub produced: bool,
    /// The artifact.
    pub artifact: Artifact,
}

/// Everything an executor needs to build one stage.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    /// The stage being built.
    pub stage: BuildStage,
    /// The stage's input-addressed digest.
    pub stage_digest: Digest,
    /// Contents of the base stage's image, root first. Empty for a public base.
    pub inherited: Vec<InheritedArtifact>,
    /// Imports in declaration order.
    pub imports: Vec<ResolvedImport>,
    /// The build run.
    pub build_id: Uuid,
}

/// Runs a stage and returns one payload per declared output.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes the stage.
    ///
    /// The returned map must contain exactly the stage's declared outputs.
    async fn execute(
        &self,
        invocation: &StageInvocation,
    ) -> Result<BTreeMap<String, ArtifactPayload>, GraphError>;
}

/// Deterministic executor that records what a stage would do.
///
/// Each output's payload is a JSON manifest of the stage's operations and the
/// content digests of its imports. Useful for planning and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestExecutor;

#[async_trait]
impl StageExecutor for ManifestExecutor {
    async fn execute(
        &self,
        invocation: &StageInvocation,
    ) -> Result<BTreeMap<String, ArtifactPayload>, GraphError> {
        let stage = &invocation.stage;
        let imports: Vec<serde_json::Value> = invocation
            .imports
            .iter()
            .map(|resolved| {
                serde_json::json!({
                    "from": resolved.import.from,
                    "artifact": resolved.import.artifact,
                    "dest": resolved.import.dest,
                    "content_digest": resolved.artifact.content_digest,
                })
            })
            .collect();

        let mut payloads = BTreeMap::new();
        for output in &stage.outputs {
            let manifest = serde_json::json!({
                "stage": stage.name,
                "artifact": output.name,
                "path": output.path,
                "base": stage.base,
                "operations": stage.operations,
                "imports": imports,
            });
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| GraphError::execution(&stage.name, e.to_string()))?;
            payloads.insert(
                output.name.clone(),
                ArtifactPayload::new().with_file("MANIFEST.json", bytes),
            );
        }
        Ok(payloads)
    }
}

const STAGE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Executor that runs `Run` operations for real inside a scratch directory.
///
/// Absolute paths in the stage are interpreted relative to the scratch root,
/// which is also exported to commands as `STAGE_ROOT`. Programs run without a
/// shell and with an environment built only from the stage's `Env` operations.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    scratch_root: PathBuf,
    keep_scratch: bool,
}

impl ShellExecutor {
    /// Creates an executor that builds under `scratch_root`.
    #[must_use]
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            keep_scratch: false,
        }
    }

    /// Keeps scratch directories after the build (for debugging).
    #[must_use]
    pub fn keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    fn io_error(stage: &str, path: &Path, err: &std::io::Error) -> GraphError {
        GraphError::execution(stage, format!("{}: {err}", path.display()))
    }

    async fn materialize(&self, stage: &str, dest: &Path, artifact: &Artifact) -> Result<(), GraphError> {
        for (relative, contents) in artifact.payload.files() {
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Self::io_error(stage, parent, &e))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(|e| Self::io_error(stage, &target, &e))?;
        }
        debug!(
            stage = %stage,
            artifact = %artifact.key,
            dest = %dest.display(),
            files = artifact.payload.len(),
            "Materialized artifact"
        );
        Ok(())
    }

    async fn run_operations(&self, stage: &BuildStage, root: &Path) -> Result<(), GraphError> {
        let mut env: HashMap<String, String> = HashMap::new();
        let mut cwd = root.to_path_buf();

        for operation in &stage.operations {
            match operation {
                BuildOperation::Env { key, value } => {
                    env.insert(key.clone(), value.clone());
                }
                BuildOperation::Workdir { path } => {
                    cwd = within(root, path);
                    tokio::fs::create_dir_all(&cwd)
                        .await
                        .map_err(|e| Self::io_error(&stage.name, &cwd, &e))?;
                }
                BuildOperation::User { name } => {
                    debug!(stage = %stage.name, user = %name, "User switch not applied in scratch builds");
                }
                BuildOperation::WriteFile { path, contents } => {
                    let target = within(root, path);
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| Self::io_error(&stage.name, parent, &e))?;
                    }
                    tokio::fs::write(&target, contents)
                        .await
                        .map_err(|e| Self::io_error(&stage.name, &target, &e))?;
                }
                BuildOperation::Run { argv } => {
                    let Some((program, args)) = argv.split_first() else {
                        return Err(GraphError::execution(&stage.name, "run operation has no program"));
                    };
                    info!(stage = %stage.name, program = %program, "Running build operation");

                    let output = Command::new(program)
                        .args(args)
                        .current_dir(&cwd)
                        .env_clear()
                        .env("PATH", STAGE_PATH)
                        .env("STAGE_ROOT", root)
                        .envs(&env)
                        .stdin(Stdio::null())
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .output()
                        .await
                        .map_err(|e| GraphError::execution(&stage.name, format!("{program}: {e}")))?;

                    if !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        return Err(GraphError::execution(
                            &stage.name,
                            format!("{} exited with {}: {}", argv.join(" "), output.status, stderr.trim()),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn collect(stage: &str, path: &Path) -> Result<ArtifactPayload, GraphError> {
        let mut payload = ArtifactPayload::new();
        if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let contents = std::fs::read(path).map_err(|e| Self::io_error(stage, path, &e))?;
            payload.insert(name, contents);
            return Ok(payload);
        }
        if !path.is_dir() {
            return Err(GraphError::execution(
                stage,
                format!("declared output {} was not produced", path.display()),
            ));
        }

        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| GraphError::execution(stage, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .map_err(|e| GraphError::execution(stage, e.to_string()))?;
            let contents = std::fs::read(entry.path()).map_err(|e| Self::io_error(stage, entry.path(), &e))?;
            payload.insert(relative.to_string_lossy().into_owned(), contents);
        }
        Ok(payload)
    }

    async fn build_in(&self, invocation: &StageInvocation, root: &Path) -> Result<BTreeMap<String, ArtifactPayload>, GraphError> {
        let stage = &invocation.stage;
        for inherited in &invocation.inherited {
            let dest = if inherited.produced {
                output_destination(root, &inherited.path, &inherited.artifact.payload)
            } else {
                within(root, &inherited.path)
            };
            self.materialize(&stage.name, &dest, &inherited.artifact).await?;
        }
        for resolved in &invocation.imports {
            let dest = within(root, &resolved.import.dest);
            self.materialize(&stage.name, &dest, &resolved.artifact).await?;
        }
        self.run_operations(stage, root).await?;

        let mut payloads = BTreeMap::new();
        for output in &stage.outputs {
            let path = within(root, &output.path);
            payloads.insert(output.name.clone(), Self::collect(&stage.name, &path)?);
        }
        Ok(payloads)
    }
}

#[async_trait]
impl StageExecutor for ShellExecutor {
    async fn execute(
        &self,
        invocation: &StageInvocation,
    ) -> Result<BTreeMap<String, ArtifactPayload>, GraphError> {
        let stage = &invocation.stage.name;
        let root = self
            .scratch_root
            .join(format!("{stage}-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Self::io_error(stage, &root, &e))?;

        let result = self.build_in(invocation, &root).await;

        if !self.keep_scratch {
            if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                warn!(stage = %stage, path = %root.display(), error = %e, "Failed to remove scratch directory");
            }
        }
        result
    }
}

/// Maps a stage path into the scratch root.
fn within(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// Where a collected output goes back to. A single-file output was collected
/// under its file name, so it is restored into the parent directory.
fn output_destination(root: &Path, path: &str, payload: &ArtifactPayload) -> PathBuf {
    let target = within(root, path);
    let file_name = target.file_name().map(|n| n.to_string_lossy().into_owned());
    let mut files = payload.files();
    match (files.next(), files.next(), file_name) {
        (Some((only, _)), None, Some(name)) if only == name => {
            target.parent().map_or_else(|| root.to_path_buf(), Path::to_path_buf)
        }
        _ => target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKey;
    use crate::graph::spec::BaseImage;

    fn invocation(stage: BuildStage, imports: Vec<ResolvedImport>) -> StageInvocation {
        StageInvocation {
            stage_digest: Digest::of_bytes(stage.name.as_bytes()),
            stage,
            inherited: Vec::new(),
            imports,
            build_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_manifest_executor_is_deterministic() {
        let stage = BuildStage::new("builder", BaseImage::public("python:3.11-slim"))
            .with_run(&["make", "venv"])
            .with_output("venv", "/opt/venv")
            .with_output("translations", "/i18n");

        let first = ManifestExecutor.execute(&invocation(stage.clone(), vec![])).await.unwrap();
        let second = ManifestExecutor.execute(&invocation(stage, vec![])).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(
            first["venv"].content_digest(),
            second["venv"].content_digest()
        );
        assert_ne!(
            first["venv"].content_digest(),
            first["translations"].content_digest()
        );
    }

    #[tokio::test]
    async fn test_shell_executor_collects_outputs_and_imports() {
        let scratch = tempfile::tempdir().unwrap();
        let translations = Artifact::new(
            ArtifactKey::new("builder", "translations"),
            Digest::of_bytes(b"t"),
            ArtifactPayload::new().with_file("de/LC_MESSAGES/linotp.mo", "mo"),
            Uuid::new_v4(),
        );
        let stage = BuildStage::new("bundle", BaseImage::public("debian:bookworm-slim"))
            .with_import("builder", "translations", "/app/i18n")
            .with_operation(BuildOperation::WriteFile {
                path: "/app/VERSION".into(),
                contents: "3.4".into(),
            })
            .with_output("app", "/app");

        let resolved = ResolvedImport {
            import: stage.imports[0].clone(),
            artifact: translations,
        };
        let payloads = ShellExecutor::new(scratch.path())
            .execute(&invocation(stage, vec![resolved]))
            .await
            .unwrap();

        let app = &payloads["app"];
        assert_eq!(app.get("VERSION"), Some(&b"3.4"[..]));
        assert_eq!(app.get("i18n/de/LC_MESSAGES/linotp.mo"), Some(&b"mo"[..]));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_shell_executor_starts_from_base_image_contents() {
        let scratch = tempfile::tempdir().unwrap();
        let conf = Artifact::new(
            ArtifactKey::new("base", "conf"),
            Digest::of_bytes(b"conf"),
            ArtifactPayload::new().with_file("app.conf", "listen=5000"),
            Uuid::new_v4(),
        );
        let venv = Artifact::new(
            ArtifactKey::new("builder", "venv"),
            Digest::of_bytes(b"venv"),
            ArtifactPayload::new().with_file("bin/python", "py"),
            Uuid::new_v4(),
        );
        let overlay = Artifact::new(
            ArtifactKey::new("settings", "conf"),
            Digest::of_bytes(b"overlay"),
            ArtifactPayload::new().with_file("app.conf", "listen=8080"),
            Uuid::new_v4(),
        );
        let stage = BuildStage::new("child", BaseImage::stage("base"))
            .with_import("settings", "conf", "/etc")
            .with_run(&["test", "-f", "opt/venv/bin/python"])
            .with_output("etc", "/etc");

        let mut invocation = invocation(
            stage.clone(),
            vec![ResolvedImport {
                import: stage.imports[0].clone(),
                artifact: overlay,
            }],
        );
        invocation.inherited = vec![
            InheritedArtifact {
                path: "/etc/app.conf".into(),
                produced: true,
                artifact: conf,
            },
            InheritedArtifact {
                path: "/opt/venv".into(),
                produced: false,
                artifact: venv,
            },
        ];

        let payloads = ShellExecutor::new(scratch.path())
            .execute(&invocation)
            .await
            .unwrap();
        assert_eq!(payloads["etc"].get("app.conf"), Some(&b"listen=8080"[..]));
    }

    #[test]
    fn test_output_destination_restores_single_files() {
        let root = Path::new("/scratch");
        let file = ArtifactPayload::new().with_file("app.conf", "x");
        let tree = ArtifactPayload::new().with_file("bin/python", "x");
        assert_eq!(output_destination(root, "/etc/app.conf", &file), PathBuf::from("/scratch/etc"));
        assert_eq!(output_destination(root, "/opt/venv", &tree), PathBuf::from("/scratch/opt/venv"));
    }

    #[tokio::test]
    async fn test_shell_executor_reports_missing_output() {
        let scratch = tempfile::tempdir().unwrap();
        let stage = BuildStage::new("empty", BaseImage::public("debian:bookworm-slim"))
            .with_output("venv", "/opt/venv");

        let err = ShellExecutor::new(scratch.path())
            .execute(&invocation(stage, vec![]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was not produced"));
    }

    #[tokio::test]
    async fn test_shell_executor_runs_without_shell() {
        let scratch = tempfile::tempdir().unwrap();
        let stage = BuildStage::new("failing", BaseImage::public("debian:bookworm-slim"))
            .with_run(&["false"]);

        let err = ShellExecutor::new(scratch.path())
            .execute(&invocation(stage, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Execution { .. }));
    }
}
