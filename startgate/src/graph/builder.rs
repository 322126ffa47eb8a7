//! Build graph builder with validation.

use super::dag::BuildGraph;
use super::executor::{ManifestExecutor, StageExecutor};
use super::spec::{BuildGraphDefinition, BuildStage};
use crate::artifacts::{ArtifactStore, InMemoryArtifactStore};
use crate::cancellation::CancellationToken;
use crate::errors::GraphError;
use crate::events::{EventSink, LoggingEventSink};
use std::sync::Arc;

/// Builder for creating validated build graphs.
///
/// Stages are checked individually as they are added; whole-graph checks
/// (unknown references, cycles, missing inputs) run in [`build`](Self::build),
/// before anything is executed.
#[derive(Clone)]
pub struct BuildGraphBuilder {
    definition: BuildGraphDefinition,
    store: Option<Arc<dyn ArtifactStore>>,
    executor: Option<Arc<dyn StageExecutor>>,
    event_sink: Option<Arc<dyn EventSink>>,
    cancel: Option<Arc<CancellationToken>>,
}

impl std::fmt::Debug for BuildGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildGraphBuilder")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl BuildGraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_definition(BuildGraphDefinition::new(name))
    }

    /// Starts from an existing definition.
    #[must_use]
    pub fn from_definition(definition: BuildGraphDefinition) -> Self {
        Self {
            definition,
            store: None,
            executor: None,
            event_sink: None,
            cancel: None,
        }
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is
    /// already taken.
    pub fn stage(mut self, stage: BuildStage) -> Result<Self, GraphError> {
        stage.validate()?;
        if self.definition.stage(&stage.name).is_some() {
            return Err(GraphError::DuplicateStage(stage.name));
        }
        self.definition.stages.push(stage);
        Ok(self)
    }

    /// Sets the artifact store. Defaults to an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the stage executor. Defaults to [`ManifestExecutor`].
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the event sink. Defaults to logging.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.definition.stages.len()
    }

    /// Returns the definition assembled so far.
    #[must_use]
    pub fn definition(&self) -> &BuildGraphDefinition {
        &self.definition
    }

    /// Validates the whole graph and builds it.
    ///
    /// # Errors
    ///
    /// Returns the first integrity violation: empty graph, unknown
    /// reference, cycle or missing input.
    pub fn build(self) -> Result<BuildGraph, GraphError> {
        BuildGraph::new(
            self.definition,
            self.store.unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new())),
            self.executor.unwrap_or_else(|| Arc::new(ManifestExecutor)),
            self.event_sink.unwrap_or_else(|| Arc::new(LoggingEventSink::default())),
            self.cancel.unwrap_or_default(),
        )
    }
}
