//! Build graph validation and execution.
//!
//! Stages are executed as soon as their predecessors have finished, allowing
//! independent stages to build in parallel.

use super::digest::{artifact_digest, stage_digest};
use super::executor::{InheritedArtifact, ResolvedImport, StageExecutor, StageInvocation};
use super::images::{compose, ImageManifest};
use super::spec::{BuildGraphDefinition, BuildStage};
use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::core::{Artifact, ArtifactKey, Digest, StageStatus};
use crate::errors::{CycleDetectedError, GraphError, MissingInputError};
use crate::events::EventSink;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Validates a graph definition and returns a topological build order.
///
/// Checks run in this order: empty graph, duplicate stage names, per-stage
/// validity, unknown references, cycles, and finally imports of artifacts
/// their source stage does not produce. The order is deterministic: ties are
/// broken by declaration order.
///
/// # Errors
///
/// Returns the first integrity violation found.
pub fn resolve(definition: &BuildGraphDefinition) -> Result<Vec<String>, GraphError> {
    if definition.stages.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut stages: HashMap<&str, &BuildStage> = HashMap::new();
    for stage in &definition.stages {
        if stages.insert(stage.name.as_str(), stage).is_some() {
            return Err(GraphError::DuplicateStage(stage.name.clone()));
        }
    }

    for stage in &definition.stages {
        stage.validate()?;
        for reference in stage.predecessors() {
            if !stages.contains_key(reference) {
                return Err(GraphError::UnknownStage {
                    stage: stage.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    detect_cycles(&definition.stages, &stages)?;

    for stage in &definition.stages {
        for import in &stage.imports {
            let produced = stages
                .get(import.from.as_str())
                .and_then(|source| source.output(&import.artifact))
                .is_some();
            if !produced {
                return Err(MissingInputError::new(&stage.name, &import.from, &import.artifact).into());
            }
        }
    }

    Ok(topological_sort(&definition.stages, &stages))
}

fn detect_cycles(
    declared: &[BuildStage],
    stages: &HashMap<&str, &BuildStage>,
) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in declared {
        if !visited.contains(stage.name.as_str()) {
            if let Some(cycle) = dfs_cycle(&stage.name, stages, &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }

    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    stages: &HashMap<&'a str, &'a BuildStage>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(&stage) = stages.get(node) {
        for dep in stage.predecessors() {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, stages, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

fn topological_sort(declared: &[BuildStage], stages: &HashMap<&str, &BuildStage>) -> Vec<String> {
    fn visit<'a>(
        node: &'a str,
        stages: &HashMap<&'a str, &'a BuildStage>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node) {
            return;
        }
        if let Some(&stage) = stages.get(node) {
            for dep in stage.predecessors() {
                visit(dep, stages, visited, result);
            }
        }
        result.push(node.to_string());
    }

    let mut result = Vec::with_capacity(declared.len());
    let mut visited = HashSet::new();
    for stage in declared {
        visit(&stage.name, stages, &mut visited, &mut result);
    }
    result
}

/// Result of building one stage.
#[derive(Debug, Clone)]
pub struct StageBuild {
    /// The stage name.
    pub stage: String,
    /// `Built` or `Cached`.
    pub status: StageStatus,
    /// The stage's input-addressed digest.
    pub stage_digest: Digest,
    /// Output artifacts by logical name.
    pub artifacts: BTreeMap<String, Artifact>,
    /// Wall time spent on the stage in milliseconds.
    pub duration_ms: f64,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The build run.
    pub build_id: Uuid,
    /// Stages that were part of this build, in topological order.
    pub order: Vec<String>,
    /// Per-stage results.
    pub stages: HashMap<String, StageBuild>,
    /// Total build time in milliseconds.
    pub duration_ms: f64,
}

impl BuildOutcome {
    /// Output artifacts of a stage.
    #[must_use]
    pub fn artifacts(&self, stage: &str) -> Option<&BTreeMap<String, Artifact>> {
        self.stages.get(stage).map(|b| &b.artifacts)
    }

    /// A single artifact.
    #[must_use]
    pub fn artifact(&self, key: &ArtifactKey) -> Option<&Artifact> {
        self.artifacts(&key.stage)?.get(&key.name)
    }

    /// Stage status.
    #[must_use]
    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.stages.get(stage).map(|b| b.status)
    }

    /// Stages served entirely from the artifact store.
    #[must_use]
    pub fn cached_stages(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|s| self.status(s) == Some(StageStatus::Cached))
            .map(String::as_str)
            .collect()
    }
}

type StageTask = JoinHandle<Result<StageBuild, GraphError>>;

/// A validated build graph bound to a store and an executor.
pub struct BuildGraph {
    name: String,
    stages: Arc<HashMap<String, BuildStage>>,
    execution_order: Vec<String>,
    store: Arc<dyn ArtifactStore>,
    executor: Arc<dyn StageExecutor>,
    event_sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for BuildGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildGraph")
            .field("name", &self.name)
            .field("execution_order", &self.execution_order)
            .finish_non_exhaustive()
    }
}

impl BuildGraph {
    /// Validates a definition and binds it to its collaborators.
    ///
    /// # Errors
    ///
    /// Returns the integrity error from [`resolve`].
    pub fn new(
        definition: BuildGraphDefinition,
        store: Arc<dyn ArtifactStore>,
        executor: Arc<dyn StageExecutor>,
        event_sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Self, GraphError> {
        let execution_order = resolve(&definition)?;
        let stages = definition
            .stages
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        Ok(Self {
            name: definition.name,
            stages: Arc::new(stages),
            execution_order,
            store,
            executor,
            event_sink,
            cancel,
        })
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the full topological order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&BuildStage> {
        self.stages.get(name)
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// The stages needed to build `target`, in topological order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if `target` is not in the graph.
    pub fn plan(&self, target: &str) -> Result<Vec<String>, GraphError> {
        if !self.stages.contains_key(target) {
            return Err(GraphError::UnknownStage {
                stage: self.name.clone(),
                reference: target.to_string(),
            });
        }

        let mut needed = HashSet::new();
        let mut stack = vec![target];
        while let Some(name) = stack.pop() {
            if needed.insert(name) {
                if let Some(stage) = self.stages.get(name) {
                    stack.extend(stage.predecessors());
                }
            }
        }

        Ok(self
            .execution_order
            .iter()
            .filter(|s| needed.contains(s.as_str()))
            .cloned()
            .collect())
    }

    /// The composed image of a stage.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage is not in the graph.
    pub fn image(&self, stage: &str) -> Result<ImageManifest, GraphError> {
        let found = self.stages.get(stage).ok_or_else(|| GraphError::UnknownStage {
            stage: self.name.clone(),
            reference: stage.to_string(),
        })?;
        Ok(compose(&self.stages, found))
    }

    /// Builds `target` and everything it depends on.
    ///
    /// Stages whose outputs are already in the store under the same digests
    /// are cache hits and are not executed.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure; remaining in-flight stages are aborted.
    pub async fn build(&self, target: &str) -> Result<BuildOutcome, GraphError> {
        let order = self.plan(target)?;
        self.execute(order).await
    }

    /// Builds every stage in the graph.
    pub async fn build_all(&self) -> Result<BuildOutcome, GraphError> {
        self.execute(self.execution_order.clone()).await
    }

    async fn execute(&self, order: Vec<String>) -> Result<BuildOutcome, GraphError> {
        let start = Instant::now();
        let build_id = Uuid::now_v7();
        let wanted: HashSet<&str> = order.iter().map(String::as_str).collect();

        info!(graph = %self.name, build_id = %build_id, stages = order.len(), "Starting build");

        let completed: Arc<RwLock<HashMap<String, StageBuild>>> = Arc::new(RwLock::new(HashMap::new()));

        let mut in_degree: HashMap<&str, usize> = order
            .iter()
            .map(|name| {
                let count = self.stages.get(name).map_or(0, |s| s.predecessors().len());
                (name.as_str(), count)
            })
            .collect();

        let mut active_tasks: FuturesUnordered<StageTask> = FuturesUnordered::new();

        for name in &order {
            if in_degree.get(name.as_str()) == Some(&0) {
                active_tasks.push(self.spawn_stage_task(name, build_id, completed.clone()));
            }
        }

        let mut completed_count = 0;
        while completed_count < order.len() {
            if active_tasks.is_empty() {
                return Err(GraphError::execution(&self.name, "build graph deadlocked"));
            }

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    abort_all(&active_tasks);
                    let reason = self.cancel.reason_or_default();
                    return Err(GraphError::Cancelled(reason));
                }
                next = active_tasks.next() => next,
            };

            let finished = match next {
                Some(Ok(Ok(build))) => build,
                Some(Ok(Err(e))) => {
                    abort_all(&active_tasks);
                    return Err(e);
                }
                Some(Err(e)) => {
                    abort_all(&active_tasks);
                    return Err(GraphError::execution(&self.name, format!("task join error: {e}")));
                }
                None => continue,
            };

            let finished_name = finished.stage.clone();
            completed.write().insert(finished_name.clone(), finished);
            completed_count += 1;

            for child in &order {
                let Some(stage) = self.stages.get(child) else {
                    continue;
                };
                if !stage.predecessors().contains(finished_name.as_str()) {
                    continue;
                }
                if let Some(count) = in_degree.get_mut(child.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 && wanted.contains(child.as_str()) {
                        active_tasks.push(self.spawn_stage_task(child, build_id, completed.clone()));
                    }
                }
            }
        }

        let stages = std::mem::take(&mut *completed.write());
        let outcome = BuildOutcome {
            build_id,
            order,
            stages,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            graph = %self.name,
            build_id = %build_id,
            cached = outcome.cached_stages().len(),
            duration_ms = outcome.duration_ms,
            "Build finished"
        );
        Ok(outcome)
    }

    /// Spawns a task to build a single stage.
    fn spawn_stage_task(
        &self,
        stage_name: &str,
        build_id: Uuid,
        completed: Arc<RwLock<HashMap<String, StageBuild>>>,
    ) -> StageTask {
        let stages = self.stages.clone();
        let store = self.store.clone();
        let executor = self.executor.clone();
        let sink = self.event_sink.clone();
        let stage_name = stage_name.to_string();

        tokio::spawn(async move {
            let Some(stage) = stages.get(&stage_name).cloned() else {
                return Err(GraphError::execution(&stage_name, "stage vanished from graph"));
            };

            let stage_start = Instant::now();
            sink.try_emit("stage.started", Some(serde_json::json!({"stage": &stage_name})));

            let result = build_stage(
                stage,
                build_id,
                &stages,
                &completed,
                store.as_ref(),
                executor.as_ref(),
            )
            .await;
            let duration_ms = stage_start.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok((status, stage_digest, artifacts)) => {
                    let event = if status == StageStatus::Cached {
                        "stage.cached"
                    } else {
                        "stage.completed"
                    };
                    sink.try_emit(
                        event,
                        Some(serde_json::json!({
                            "stage": &stage_name,
                            "digest": stage_digest,
                            "artifacts": artifacts.len(),
                            "duration_ms": duration_ms,
                        })),
                    );
                    Ok(StageBuild {
                        stage: stage_name,
                        status,
                        stage_digest,
                        artifacts,
                        duration_ms,
                    })
                }
                Err(e) => {
                    sink.try_emit(
                        "stage.failed",
                        Some(serde_json::json!({
                            "stage": &stage_name,
                            "error": e.to_string(),
                            "duration_ms": duration_ms,
                        })),
                    );
                    Err(e)
                }
            }
        })
    }
}

fn abort_all(tasks: &FuturesUnordered<StageTask>) {
    for task in tasks {
        task.abort();
    }
}

async fn build_stage(
    stage: BuildStage,
    build_id: Uuid,
    stages: &HashMap<String, BuildStage>,
    completed: &RwLock<HashMap<String, StageBuild>>,
    store: &dyn ArtifactStore,
    executor: &dyn StageExecutor,
) -> Result<(StageStatus, Digest, BTreeMap<String, Artifact>), GraphError> {
    let (base_digest, imports) = {
        let done = completed.read();
        let base_digest = stage
            .base
            .stage_name()
            .and_then(|base| done.get(base))
            .map(|b| b.stage_digest.clone());

        let mut imports = Vec::with_capacity(stage.imports.len());
        for import in &stage.imports {
            let artifact = done
                .get(&import.from)
                .and_then(|b| b.artifacts.get(&import.artifact))
                .cloned()
                .ok_or_else(|| MissingInputError::new(&stage.name, &import.from, &import.artifact))?;
            imports.push(ResolvedImport {
                import: import.clone(),
                artifact,
            });
        }
        (base_digest, imports)
    };

    let import_digests: Vec<Digest> = imports.iter().map(|i| i.artifact.digest.clone()).collect();
    let digest = stage_digest(&stage, base_digest.as_ref(), &import_digests);
    let expected: Vec<(ArtifactKey, Digest)> = stage
        .outputs
        .iter()
        .map(|o| (ArtifactKey::new(&stage.name, &o.name), artifact_digest(&digest, o)))
        .collect();

    if !expected.is_empty() {
        let mut cached = BTreeMap::new();
        for (key, output_digest) in &expected {
            match store.get(key, output_digest).await {
                Some(artifact) => {
                    cached.insert(key.name.clone(), artifact);
                }
                None => break,
            }
        }
        if cached.len() == expected.len() {
            debug!(stage = %stage.name, digest = %digest.short(), "Stage served from artifact store");
            return Ok((StageStatus::Cached, digest, cached));
        }
    }

    let inherited = inherited_artifacts(&stage, stages, &completed.read())?;
    let invocation = StageInvocation {
        stage,
        stage_digest: digest.clone(),
        inherited,
        imports,
        build_id,
    };
    let mut payloads = executor.execute(&invocation).await?;
    let stage = invocation.stage;

    if let Some(extra) = payloads.keys().find(|name| stage.output(name).is_none()) {
        return Err(GraphError::execution(
            &stage.name,
            format!("executor produced undeclared artifact '{extra}'"),
        ));
    }

    let mut artifacts = BTreeMap::new();
    for (key, output_digest) in expected {
        let payload = payloads.remove(&key.name).ok_or_else(|| {
            GraphError::execution(&stage.name, format!("declared output '{}' was not produced", key.name))
        })?;
        let name = key.name.clone();
        let outcome = store
            .put(Artifact::new(key, output_digest, payload, build_id))
            .await?;
        artifacts.insert(name, outcome.artifact().clone());
    }

    Ok((StageStatus::Built, digest, artifacts))
}

/// The artifacts of `stage`'s base image, in image order. Every stage in the
/// lineage is a predecessor, so all of them are complete by now.
fn inherited_artifacts(
    stage: &BuildStage,
    stages: &HashMap<String, BuildStage>,
    done: &HashMap<String, StageBuild>,
) -> Result<Vec<InheritedArtifact>, GraphError> {
    let Some(base) = stage.base.stage_name().and_then(|name| stages.get(name)) else {
        return Ok(Vec::new());
    };
    compose(stages, base)
        .entries
        .into_iter()
        .map(|entry| {
            let key = entry.artifact;
            let artifact = done
                .get(&key.stage)
                .and_then(|b| b.artifacts.get(&key.name))
                .cloned()
                .ok_or_else(|| MissingInputError::new(&stage.name, &key.stage, &key.name))?;
            let produced = stages
                .get(&key.stage)
                .and_then(|s| s.output(&key.name))
                .is_some_and(|output| output.path == entry.path);
            Ok(InheritedArtifact {
                path: entry.path,
                produced,
                artifact,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::graph::spec::BaseImage;
    use crate::graph::ManifestExecutor;
    use pretty_assertions::assert_eq;

    fn definition() -> BuildGraphDefinition {
        BuildGraphDefinition::new("test")
            .with_stage(BuildStage::new("base", BaseImage::public("debian:bookworm-slim")))
            .with_stage(
                BuildStage::new("builder", BaseImage::stage("base"))
                    .with_run(&["make", "venv"])
                    .with_output("venv", "/opt/venv"),
            )
            .with_stage(
                BuildStage::new("production", BaseImage::stage("base"))
                    .with_import("builder", "venv", "/opt/venv"),
            )
    }

    fn graph(definition: BuildGraphDefinition, sink: Arc<dyn EventSink>) -> BuildGraph {
        BuildGraph::new(
            definition,
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(ManifestExecutor),
            sink,
            Arc::new(CancellationToken::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_orders_predecessors_first() {
        let order = resolve(&definition()).unwrap();
        assert_eq!(order, vec!["base", "builder", "production"]);
    }

    #[test]
    fn test_resolve_is_independent_of_declaration_order() {
        let mut def = definition();
        def.stages.reverse();
        let order = resolve(&def).unwrap();

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("base") < pos("builder"));
        assert!(pos("builder") < pos("production"));
    }

    #[test]
    fn test_resolve_detects_cycle() {
        let def = BuildGraphDefinition::new("cyclic")
            .with_stage(
                BuildStage::new("a", BaseImage::stage("b")).with_output("x", "/x"),
            )
            .with_stage(BuildStage::new("b", BaseImage::public("scratch")).with_import("a", "x", "/x"));

        match resolve(&def) {
            Err(GraphError::CycleDetected(err)) => {
                assert_eq!(err.cycle_path, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_detects_missing_input() {
        let def = definition().with_stage(
            BuildStage::new("testenv", BaseImage::stage("base")).with_import("builder", "wheels", "/wheels"),
        );
        let err = resolve(&def).unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingInput(MissingInputError::new("testenv", "builder", "wheels"))
        );
    }

    #[test]
    fn test_resolve_detects_unknown_and_duplicate() {
        let unknown = definition()
            .with_stage(BuildStage::new("e2e", BaseImage::stage("nope")));
        assert!(matches!(resolve(&unknown), Err(GraphError::UnknownStage { .. })));

        let duplicate = definition()
            .with_stage(BuildStage::new("base", BaseImage::public("alpine")));
        assert_eq!(resolve(&duplicate), Err(GraphError::DuplicateStage("base".into())));

        assert_eq!(resolve(&BuildGraphDefinition::new("empty")), Err(GraphError::Empty));
    }

    #[test]
    fn test_plan_includes_only_ancestors() {
        let def = definition().with_stage(
            BuildStage::new("testdata", BaseImage::public("alpine")).with_output("fixtures", "/data"),
        );
        let graph = graph(def, Arc::new(NoOpEventSink));
        assert_eq!(graph.plan("builder").unwrap(), vec!["base", "builder"]);
        assert!(graph.plan("missing").is_err());
    }

    #[tokio::test]
    async fn test_build_registers_artifacts_and_emits_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let graph = graph(definition(), sink.clone());

        let outcome = graph.build("production").await.unwrap();
        assert_eq!(outcome.order, vec!["base", "builder", "production"]);
        assert_eq!(outcome.status("builder"), Some(StageStatus::Built));

        let venv = outcome.artifact(&ArtifactKey::new("builder", "venv")).unwrap();
        assert_eq!(venv.build_id, outcome.build_id);
        assert_eq!(graph.store().len(), 1);

        let started = sink.field_values("stage.started", "stage");
        assert_eq!(started.len(), 3);
        assert_eq!(sink.events_of_type("stage.completed").len(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_is_cache_hit_with_identical_digests() {
        let graph = graph(definition(), Arc::new(NoOpEventSink));
        let key = ArtifactKey::new("builder", "venv");

        let first = graph.build("production").await.unwrap();
        let second = graph.build("production").await.unwrap();

        assert_eq!(second.status("builder"), Some(StageStatus::Cached));
        let a = first.artifact(&key).unwrap();
        let b = second.artifact(&key).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.content_digest, b.content_digest);
        assert_eq!(b.build_id, first.build_id);
        assert_eq!(graph.store().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_build_returns_error() {
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("SIGTERM");
        let graph = BuildGraph::new(
            definition(),
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(ManifestExecutor),
            Arc::new(NoOpEventSink),
            cancel,
        )
        .unwrap();

        let err = graph.build_all().await.unwrap_err();
        assert_eq!(err, GraphError::Cancelled("SIGTERM".into()));
    }
}
