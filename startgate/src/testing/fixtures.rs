//! Ready-made configurations and graphs for tests.

use std::path::Path;

use crate::config::{StartupConfig, DEFAULT_ENV_PREFIX};
use crate::errors::ConfigError;
use crate::graph::{BaseImage, BuildGraphDefinition, BuildStage};

/// Database URI used by fixture configurations.
pub const FIXTURE_DATABASE_URI: &str = "postgresql://linotp:secret@db/linotp";

/// Environment variables for a configuration whose every directory lives
/// under `root`.
#[must_use]
pub fn fixture_vars(root: &Path) -> Vec<(String, String)> {
    let dir = |name: &str| root.join(name).display().to_string();
    [
        ("ROOT_DIR", dir("lib")),
        ("CACHE_DIR", dir("cache")),
        ("BACKUP_DIR", dir("backups")),
        ("LOG_DIR", dir("log")),
        ("CUSTOM_TEMPLATES_DIR", dir("custom-templates")),
        ("CUSTOM_ASSETS_DIR", dir("custom-assets")),
        ("APP_DIR", dir("app")),
        ("CA_CERTIFICATES_DIR", dir("ca-certificates")),
        ("CA_STORE_DIR", dir("ca-store")),
        ("DATABASE_URI", FIXTURE_DATABASE_URI.to_string()),
        ("DB_WAITTIME", "5s".to_string()),
        ("DB_POLL_INTERVAL", "1s".to_string()),
        ("ADMIN_PASSWORD", "admin-secret".to_string()),
    ]
    .into_iter()
    .map(|(name, value)| (format!("{DEFAULT_ENV_PREFIX}_{name}"), value))
    .collect()
}

/// A configuration rooted at `root`, with extra `overrides` (unprefixed names).
pub fn fixture_config(root: &Path, overrides: &[(&str, &str)]) -> Result<StartupConfig, ConfigError> {
    let mut vars = fixture_vars(root);
    for (name, value) in overrides {
        let key = format!("{DEFAULT_ENV_PREFIX}_{name}");
        vars.retain(|(k, _)| k != &key);
        vars.push((key, (*value).to_string()));
    }
    StartupConfig::from_vars(DEFAULT_ENV_PREFIX, vars)
}

/// `s0 <- s1 <- ... <- s{n-1}`, each stage importing its predecessor's output.
#[must_use]
pub fn chain_graph(n: usize) -> BuildGraphDefinition {
    let mut definition = BuildGraphDefinition::new(format!("chain-{n}"));
    for i in 0..n {
        let name = format!("s{i}");
        let stage = if i == 0 {
            BuildStage::new(&name, BaseImage::public("debian:bookworm-slim"))
        } else {
            BuildStage::new(&name, BaseImage::public("debian:bookworm-slim")).with_import(
                format!("s{}", i - 1),
                "out",
                format!("/in/s{}", i - 1),
            )
        };
        definition = definition.with_stage(
            stage
                .with_run(&["make", &name])
                .with_output("out", format!("/out/{name}")),
        );
    }
    definition
}

/// `base`, two independent branches on top of it, and a `final` stage that
/// imports from both.
#[must_use]
pub fn diamond_graph() -> BuildGraphDefinition {
    BuildGraphDefinition::new("diamond")
        .with_stage(
            BuildStage::new("base", BaseImage::public("debian:bookworm-slim"))
                .with_run(&["apt-get", "install", "-y", "python3"])
                .with_output("venv", "/opt/venv"),
        )
        .with_stage(
            BuildStage::new("left", BaseImage::stage("base"))
                .with_run(&["build", "left"])
                .with_output("wheel", "/dist/left.whl"),
        )
        .with_stage(
            BuildStage::new("right", BaseImage::stage("base"))
                .with_run(&["build", "right"])
                .with_output("docs", "/dist/docs"),
        )
        .with_stage(
            BuildStage::new("final", BaseImage::public("debian:bookworm-slim"))
                .with_import("left", "wheel", "/tmp/left.whl")
                .with_import("right", "docs", "/usr/share/doc/app")
                .with_run(&["install", "/tmp/left.whl"]),
        )
}
