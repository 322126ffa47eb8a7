//! The service's image family.
//!
//! `production` carries only the virtual environment, the compiled
//! translation catalogs and the CA bundle. Build tooling and wheels stay in
//! `builder`; the test images pull in what they need explicitly.

use super::spec::{BaseImage, BuildGraphDefinition, BuildOperation, BuildStage};

const DEBIAN: &str = "debian:bookworm-slim";
const VENV: &str = "/opt/linotp/venv";

fn env(key: &str, value: &str) -> BuildOperation {
    BuildOperation::Env {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Returns the built-in graph definition.
#[must_use]
pub fn service_image_family() -> BuildGraphDefinition {
    BuildGraphDefinition::new("linotp-images")
        .with_stage(
            BuildStage::new("base", BaseImage::public(DEBIAN))
                .with_operation(env("LANG", "C.UTF-8"))
                .with_operation(env("DEBIAN_FRONTEND", "noninteractive"))
                .with_run(&["apt-get", "update"])
                .with_run(&[
                    "apt-get",
                    "install",
                    "--yes",
                    "--no-install-recommends",
                    "python3",
                    "libpq5",
                    "default-mysql-client",
                    "ca-certificates",
                ]),
        )
        .with_stage(
            BuildStage::new("builder", BaseImage::stage("base"))
                .with_run(&[
                    "apt-get",
                    "install",
                    "--yes",
                    "build-essential",
                    "python3-dev",
                    "python3-venv",
                    "libpq-dev",
                    "gettext",
                ])
                .with_operation(BuildOperation::Workdir { path: "/build".into() })
                .with_run(&["python3", "-m", "venv", VENV])
                .with_run(&["/opt/linotp/venv/bin/pip", "wheel", "--wheel-dir", "/build/dist", "."])
                .with_run(&["/opt/linotp/venv/bin/pip", "install", "--no-index", "--find-links", "/build/dist", "linotp"])
                .with_run(&["/opt/linotp/venv/bin/pybabel", "compile", "--directory", "linotp/i18n"])
                .with_output("venv", VENV)
                .with_output("translations", "/build/linotp/i18n")
                .with_output("wheels", "/build/dist"),
        )
        .with_stage(
            BuildStage::new("ca-bundle", BaseImage::public(DEBIAN))
                .with_run(&["update-ca-certificates", "--fresh"])
                .with_output("ca-bundle", "/etc/ssl/certs"),
        )
        .with_stage(
            BuildStage::new("production", BaseImage::stage("base"))
                .with_import("builder", "venv", VENV)
                .with_import("builder", "translations", "/usr/share/linotp/i18n")
                .with_import("ca-bundle", "ca-bundle", "/etc/ssl/certs")
                .with_operation(env("PATH", "/opt/linotp/venv/bin:/usr/sbin:/usr/bin:/sbin:/bin"))
                .with_run(&["useradd", "--system", "--home-dir", "/var/lib/linotp", "linotp"])
                .with_operation(BuildOperation::Workdir {
                    path: "/var/lib/linotp".into(),
                }),
        )
        .with_stage(
            BuildStage::new("testdata", BaseImage::public(DEBIAN))
                .with_operation(BuildOperation::WriteFile {
                    path: "/data/admin-realm.json".into(),
                    contents: r#"{"realm": "testrealm", "resolvers": ["testresolver"]}"#.into(),
                })
                .with_output("fixtures", "/data"),
        )
        .with_stage(
            BuildStage::new("testenv", BaseImage::stage("production"))
                .with_import("builder", "wheels", "/wheels")
                .with_run(&[
                    "/opt/linotp/venv/bin/pip",
                    "install",
                    "--find-links",
                    "/wheels",
                    "linotp[test]",
                ]),
        )
        .with_stage(
            BuildStage::new("pytest", BaseImage::stage("testenv"))
                .with_import("testdata", "fixtures", "/app/tests/data")
                .with_operation(BuildOperation::Workdir { path: "/app".into() }),
        )
        .with_stage(
            BuildStage::new("e2e", BaseImage::stage("testenv"))
                .with_import("testdata", "fixtures", "/app/tests/data")
                .with_run(&["/opt/linotp/venv/bin/pip", "install", "selenium"])
                .with_operation(BuildOperation::Workdir {
                    path: "/app/tests/integration".into(),
                }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKey;
    use crate::graph::{resolve, BuildGraphBuilder};

    #[test]
    fn test_family_resolves() {
        let order = resolve(&service_image_family()).unwrap();
        assert_eq!(order.len(), 8);
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("builder") < pos("production"));
        assert!(pos("production") < pos("testenv"));
        assert!(pos("testdata") < pos("pytest"));
    }

    #[test]
    fn test_production_does_not_leak_build_artifacts() {
        let graph = BuildGraphBuilder::from_definition(service_image_family())
            .build()
            .unwrap();
        let production = graph.image("production").unwrap();

        assert!(production.contains(&ArtifactKey::new("builder", "venv")));
        assert!(production.contains(&ArtifactKey::new("builder", "translations")));
        assert!(production.contains(&ArtifactKey::new("ca-bundle", "ca-bundle")));
        assert!(!production.contains(&ArtifactKey::new("builder", "wheels")));

        let pytest = graph.image("pytest").unwrap();
        assert_eq!(pytest.lineage, vec!["base", "production", "testenv", "pytest"]);
        assert!(pytest.contains(&ArtifactKey::new("builder", "wheels")));
        assert!(pytest.contains(&ArtifactKey::new("testdata", "fixtures")));
    }
}
