//! End-to-end tests of the build stage graph.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use startgate::core::{ArtifactKey, ArtifactPayload, StageStatus};
use startgate::errors::GraphError;
use startgate::events::CollectingEventSink;
use startgate::graph::{
    resolve, service_image_family, BaseImage, BuildGraphBuilder, BuildGraphDefinition, BuildOperation,
    BuildStage, EntryOrigin, ManifestExecutor, ShellExecutor, StageExecutor, StageInvocation,
};
use startgate::testing::diamond_graph;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CountingExecutor {
    runs: AtomicUsize,
}

#[async_trait]
impl StageExecutor for CountingExecutor {
    async fn execute(
        &self,
        invocation: &StageInvocation,
    ) -> Result<BTreeMap<String, ArtifactPayload>, GraphError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ManifestExecutor.execute(invocation).await
    }
}

#[tokio::test]
async fn production_rebuild_is_a_cache_hit() {
    let executor = Arc::new(CountingExecutor::default());
    let graph = BuildGraphBuilder::from_definition(service_image_family())
        .with_executor(executor.clone())
        .build()
        .unwrap();

    let first = graph.build("production").await.unwrap();
    assert_eq!(first.order, vec!["base", "builder", "ca-bundle", "production"]);
    let runs_after_first = executor.runs.load(Ordering::SeqCst);
    assert_eq!(runs_after_first, 4);

    // `base` and `production` declare no outputs, so only they run again.
    let second = graph.build("production").await.unwrap();
    assert_eq!(executor.runs.load(Ordering::SeqCst), runs_after_first + 2);
    assert_eq!(second.status("builder"), Some(StageStatus::Cached));
    assert_eq!(second.status("ca-bundle"), Some(StageStatus::Cached));

    let venv = ArtifactKey::new("builder", "venv");
    assert_eq!(
        first.artifact(&venv).map(|a| &a.digest),
        second.artifact(&venv).map(|a| &a.digest)
    );
    assert_eq!(
        first.artifact(&venv).map(|a| &a.content_digest),
        second.artifact(&venv).map(|a| &a.content_digest)
    );
}

#[tokio::test]
async fn changed_operation_invalidates_downstream() {
    let build = |flag: &'static str| async move {
        let definition = BuildGraphDefinition::new("two")
            .with_stage(
                BuildStage::new("builder", BaseImage::public("debian:bookworm-slim"))
                    .with_run(&["make", flag])
                    .with_output("bin", "/out/bin"),
            )
            .with_stage(
                BuildStage::new("app", BaseImage::public("debian:bookworm-slim"))
                    .with_import("builder", "bin", "/usr/local/bin")
                    .with_output("image", "/"),
            );
        BuildGraphBuilder::from_definition(definition)
            .build()
            .unwrap()
            .build_all()
            .await
            .unwrap()
    };

    let release = build("release").await;
    let debug = build("debug").await;
    let key = ArtifactKey::new("app", "image");
    assert_ne!(
        release.artifact(&key).map(|a| &a.digest),
        debug.artifact(&key).map(|a| &a.digest)
    );
}

#[tokio::test]
async fn cyclic_definition_builds_nothing() {
    let json = r#"{
        "name": "loop",
        "stages": [
            {"name": "a", "base": {"kind": "stage", "stage": "c"}},
            {"name": "b", "base": {"kind": "stage", "stage": "a"}},
            {"name": "c", "base": {"kind": "stage", "stage": "b"}}
        ]
    }"#;
    let definition = BuildGraphDefinition::from_json(json).unwrap();
    assert!(matches!(resolve(&definition), Err(GraphError::CycleDetected(_))));

    let executor = Arc::new(CountingExecutor::default());
    let result = BuildGraphBuilder::from_definition(definition)
        .with_executor(executor.clone())
        .build();
    let err = result.err().map(|e| e.info().code);
    assert_eq!(err.as_deref(), Some("GRAPH-001-CYCLE"));
    assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn diamond_builds_each_stage_once() {
    let executor = Arc::new(CountingExecutor::default());
    let sink = Arc::new(CollectingEventSink::new());
    let graph = BuildGraphBuilder::from_definition(diamond_graph())
        .with_executor(executor.clone())
        .with_event_sink(sink.clone())
        .build()
        .unwrap();

    let outcome = graph.build("final").await.unwrap();
    assert_eq!(executor.runs.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.order.first().map(String::as_str), Some("base"));
    assert_eq!(outcome.order.last().map(String::as_str), Some("final"));
    assert_eq!(sink.events_of_type("stage.completed").len(), 4);

    let image = graph.image("final").unwrap();
    assert!(image.contains(&ArtifactKey::new("left", "wheel")));
    assert!(image.contains(&ArtifactKey::new("right", "docs")));
    assert!(!image.contains(&ArtifactKey::new("base", "venv")));
}

#[tokio::test]
async fn child_stage_builds_on_its_base_filesystem() {
    let scratch = tempfile::tempdir().unwrap();
    let definition = BuildGraphDefinition::new("lineage")
        .with_stage(
            BuildStage::new("base", BaseImage::public("debian:bookworm-slim"))
                .with_operation(BuildOperation::WriteFile {
                    path: "/etc/app.conf".into(),
                    contents: "listen=5000".into(),
                })
                .with_output("conf", "/etc/app.conf"),
        )
        .with_stage(
            BuildStage::new("child", BaseImage::stage("base"))
                .with_run(&["test", "-f", "etc/app.conf"])
                .with_operation(BuildOperation::WriteFile {
                    path: "/srv/marker".into(),
                    contents: "ok".into(),
                })
                .with_output("srv", "/srv"),
        );
    let graph = BuildGraphBuilder::from_definition(definition)
        .with_executor(Arc::new(ShellExecutor::new(scratch.path())))
        .build()
        .unwrap();

    let image = graph.image("child").unwrap();
    let conf = ArtifactKey::new("base", "conf");
    assert!(image.contains(&conf));
    assert!(image
        .entries
        .iter()
        .any(|e| e.artifact == conf && e.origin == EntryOrigin::Inherited { from: "base".into() }));

    let outcome = graph.build("child").await.unwrap();
    assert_eq!(outcome.status("child"), Some(StageStatus::Built));
    let srv = outcome.artifact(&ArtifactKey::new("child", "srv")).unwrap();
    assert_eq!(srv.payload.get("marker"), Some(&b"ok"[..]));
}
