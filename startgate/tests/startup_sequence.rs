//! The startup sequence against a scratch filesystem, with every external
//! seam replaced by a recording double.

use pretty_assertions::assert_eq;
use startgate::bootstrap::{BootstrapOrchestrator, ServiceIdentity, StartupFlags};
use startgate::config::StartupConfig;
use startgate::core::{StartupStep, EXIT_PRIVILEGE_DENIED};
use startgate::events::CollectingEventSink;
use startgate::privilege::AllowList;
use startgate::process::{ExecOutput, LaunchOutcome};
use startgate::testing::{
    fixture_config, RecordingExecutor, RecordingLauncher, ScriptedProbe, StaticIdentities,
};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Run {
    executor: Arc<RecordingExecutor>,
    launcher: Arc<RecordingLauncher>,
    sink: Arc<CollectingEventSink>,
}

impl Run {
    fn new() -> Self {
        Self {
            executor: Arc::new(RecordingExecutor::new()),
            launcher: Arc::new(RecordingLauncher::new()),
            sink: Arc::new(CollectingEventSink::new()),
        }
    }

    fn orchestrator(&self, config: &Arc<StartupConfig>) -> BootstrapOrchestrator {
        BootstrapOrchestrator::for_config(config.clone())
            .unwrap()
            .with_executor(self.executor.clone())
            .with_launcher(self.launcher.clone())
            .with_probe(Arc::new(ScriptedProbe::always()))
            .with_identities(Arc::new(StaticIdentities::new(ServiceIdentity::new(
                "linotp", 1000, 1000,
            ))))
            .with_event_sink(self.sink.clone())
    }
}

/// Every path under `root` with what it is: a directory, a file's bytes or
/// a link's target.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    let mut entries = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let meta = fs::symlink_metadata(&path).unwrap();
            let kind = if meta.file_type().is_symlink() {
                format!("link -> {}", fs::read_link(&path).unwrap().display())
            } else if meta.is_dir() {
                stack.push(path.clone());
                "dir".to_string()
            } else {
                format!("file {}", String::from_utf8_lossy(&fs::read(&path).unwrap()))
            };
            entries.insert(path.strip_prefix(root).unwrap().to_path_buf(), kind);
        }
    }
    entries
}

fn prepared_volume() -> (TempDir, Arc<StartupConfig>) {
    let dir = TempDir::new().unwrap();
    let config = fixture_config(dir.path(), &[]).unwrap();
    fs::create_dir_all(&config.custom_templates_dir).unwrap();
    fs::write(config.custom_templates_dir.join("login.mako"), "custom").unwrap();
    fs::create_dir_all(&config.ca_certificates_dir).unwrap();
    fs::write(config.ca_certificates_dir.join("corp-root.pem"), "-----BEGIN CERTIFICATE-----").unwrap();
    (dir, Arc::new(config))
}

#[tokio::test]
async fn second_start_on_same_volume_changes_nothing() {
    let (dir, config) = prepared_volume();

    let first = Run::new();
    let outcome = first
        .orchestrator(&config)
        .run_startup_sequence(StartupFlags::default())
        .await
        .unwrap();
    assert_eq!(outcome, LaunchOutcome::HandedOff);
    assert_eq!(first.executor.command_lines(), vec!["update-ca-certificates"]);
    let after_first = snapshot(dir.path());

    let link = config.app_dir.join("templates").join("custom");
    assert_eq!(fs::read_link(&link).unwrap(), config.custom_templates_dir);
    let assets = config.app_dir.join("public").join("custom");
    assert_eq!(fs::read_link(&assets).unwrap(), config.custom_assets_dir);
    assert!(config.ca_store_dir.join("corp-root.crt").is_file());

    let second = Run::new();
    second
        .orchestrator(&config)
        .run_startup_sequence(StartupFlags::default())
        .await
        .unwrap();
    assert!(second.executor.is_empty());
    assert_eq!(snapshot(dir.path()), after_first);
    assert_eq!(second.launcher.launches().len(), 1);
}

#[tokio::test]
async fn fresh_volume_gets_custom_dirs_and_resolving_links() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(fixture_config(dir.path(), &[]).unwrap());
    assert!(!config.custom_templates_dir.exists());
    assert!(!config.custom_assets_dir.exists());

    let run = Run::new();
    run.orchestrator(&config)
        .run_startup_sequence(StartupFlags::default())
        .await
        .unwrap();

    let owner = nix::unistd::geteuid().as_raw();
    for custom in [&config.custom_templates_dir, &config.custom_assets_dir] {
        let meta = fs::metadata(custom).unwrap();
        assert!(meta.is_dir(), "{}", custom.display());
        assert_eq!(meta.uid(), owner, "{}", custom.display());
    }
    for (link, target) in config.custom_links() {
        assert_eq!(fs::read_link(&link).unwrap(), target);
        assert_eq!(fs::canonicalize(&link).unwrap(), fs::canonicalize(&target).unwrap());
    }
    assert_eq!(
        run.sink.field_values("startup.step.completed", "step")[..3],
        ["ca_certificates", "layout", "symlinks"]
    );
}

#[tokio::test]
async fn unlisted_root_operation_is_fatal() {
    let (_dir, config) = prepared_volume();
    let run = Run::new();

    let failure = run
        .orchestrator(&config)
        .with_allow_list(Arc::new(AllowList::default()))
        .run_startup_sequence(StartupFlags::default())
        .await
        .unwrap_err();

    assert_eq!(failure.step, StartupStep::CaCertificates);
    assert_eq!(failure.exit_code(), EXIT_PRIVILEGE_DENIED);
    assert!(run.executor.is_empty());
    assert!(run.launcher.launches().is_empty());
    assert_eq!(run.sink.events_of_type("privilege.denied").len(), 1);
}

#[tokio::test]
async fn existing_admin_is_not_recreated() {
    let (_dir, config) = prepared_volume();
    fs::create_dir_all(&config.root_dir).unwrap();
    fs::write(config.root_dir.join("encKey"), "key").unwrap();
    fs::write(config.root_dir.join("audit-private.pem"), "key").unwrap();

    let run = Run::new();
    run.executor
        .respond("linotp local-admins list", ExecOutput::ok("admin  (local)\n"));
    run.orchestrator(&config)
        .run_startup_sequence(StartupFlags { with_bootstrap: true })
        .await
        .unwrap();

    assert_eq!(
        run.executor.command_lines(),
        vec![
            "update-ca-certificates",
            "linotp init database",
            "linotp local-admins list",
        ]
    );
}

#[tokio::test]
async fn server_environment_passes_options_through_without_credentials() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(
        fixture_config(dir.path(), &[("DISABLE_CONTROLLERS", "gettoken selfservice")]).unwrap(),
    );
    let run = Run::new();
    run.orchestrator(&config)
        .run_startup_sequence(StartupFlags::default())
        .await
        .unwrap();

    let launch = run.launcher.launches().remove(0);
    assert_eq!(
        launch.env.get("LINOTP_DISABLE_CONTROLLERS").map(String::as_str),
        Some("gettoken selfservice")
    );
    assert!(!launch.env.contains_key("LINOTP_ADMIN_PASSWORD"));
    assert!(!launch.env.contains_key("LINOTP_ADMIN_USER"));
    assert_eq!(launch.cwd.as_deref(), Some(config.root_dir.as_path()));
}
