//! Input-addressed digests for stages and their artifacts.
//!
//! A stage digest covers the stage name, its base (with the base stage's own
//! digest when it builds on another stage), its ordered operations and the
//! digests of everything it imports. Each output artifact's digest is then
//! derived from the stage digest and the output declaration. Neither depends
//! on wall-clock time or build identity, so a rebuild with unchanged inputs
//! lands on the same digests.

use super::spec::{ArtifactOutput, BaseImage, BuildOperation, BuildStage};
use crate::core::Digest;
use serde::Serialize;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BaseFingerprint<'a> {
    Public { reference: &'a str },
    Stage { stage: &'a str, digest: &'a str },
}

#[derive(Serialize)]
struct ImportFingerprint<'a> {
    from: &'a str,
    artifact: &'a str,
    dest: &'a str,
    digest: &'a str,
}

#[derive(Serialize)]
struct StageFingerprint<'a> {
    stage: &'a str,
    base: BaseFingerprint<'a>,
    operations: &'a [BuildOperation],
    /// Sorted so that declaration order of imports does not matter.
    imports: Vec<ImportFingerprint<'a>>,
}

#[derive(Serialize)]
struct ArtifactFingerprint<'a> {
    stage_digest: &'a str,
    output: &'a ArtifactOutput,
}

fn hash_canonical<T: Serialize>(value: &T) -> Digest {
    // Struct fields serialize in declaration order, so the JSON is canonical.
    let json = serde_json::to_vec(value).unwrap_or_default();
    Digest::of_bytes(&json)
}

/// Computes a stage digest.
///
/// `base_digest` is the digest of the base stage (ignored for public bases);
/// `import_digests` pairs each of `stage.imports` with the digest of the
/// artifact it resolves to, in the same order.
#[must_use]
pub fn stage_digest(
    stage: &BuildStage,
    base_digest: Option<&Digest>,
    import_digests: &[Digest],
) -> Digest {
    let base = match &stage.base {
        BaseImage::Public { reference } => BaseFingerprint::Public { reference },
        BaseImage::Stage { stage } => BaseFingerprint::Stage {
            stage,
            digest: base_digest.map_or("", Digest::as_str),
        },
    };

    let mut imports: Vec<ImportFingerprint<'_>> = stage
        .imports
        .iter()
        .zip(import_digests)
        .map(|(import, digest)| ImportFingerprint {
            from: &import.from,
            artifact: &import.artifact,
            dest: &import.dest,
            digest: digest.as_str(),
        })
        .collect();
    imports.sort_by(|a, b| (a.from, a.artifact, a.dest).cmp(&(b.from, b.artifact, b.dest)));

    hash_canonical(&StageFingerprint {
        stage: &stage.name,
        base,
        operations: &stage.operations,
        imports,
    })
}

/// Computes the digest of one output of a stage.
#[must_use]
pub fn artifact_digest(stage_digest: &Digest, output: &ArtifactOutput) -> Digest {
    hash_canonical(&ArtifactFingerprint {
        stage_digest: stage_digest.as_str(),
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> BuildStage {
        BuildStage::new("builder", BaseImage::stage("base"))
            .with_run(&["python3", "-m", "venv", "/opt/venv"])
            .with_output("venv", "/opt/venv")
            .with_import("deps", "wheels", "/wheels")
            .with_import("deps", "constraints", "/constraints")
    }

    #[test]
    fn test_digest_is_stable() {
        let base = Digest::of_bytes(b"base");
        let imports = [Digest::of_bytes(b"w"), Digest::of_bytes(b"c")];
        let a = stage_digest(&builder(), Some(&base), &imports);
        let b = stage_digest(&builder(), Some(&base), &imports);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_digest_depends_on_operations_and_inputs() {
        let base = Digest::of_bytes(b"base");
        let imports = [Digest::of_bytes(b"w"), Digest::of_bytes(b"c")];
        let reference = stage_digest(&builder(), Some(&base), &imports);

        let more_ops = builder().with_run(&["pip", "install", "linotp"]);
        assert_ne!(stage_digest(&more_ops, Some(&base), &imports), reference);

        let other_base = Digest::of_bytes(b"base2");
        assert_ne!(stage_digest(&builder(), Some(&other_base), &imports), reference);

        let other_imports = [Digest::of_bytes(b"w2"), Digest::of_bytes(b"c")];
        assert_ne!(stage_digest(&builder(), Some(&base), &other_imports), reference);
    }

    #[test]
    fn test_import_order_does_not_matter() {
        let base = Digest::of_bytes(b"base");
        let forward = builder();
        let mut reversed = builder();
        reversed.imports.reverse();

        let w = Digest::of_bytes(b"w");
        let c = Digest::of_bytes(b"c");
        assert_eq!(
            stage_digest(&forward, Some(&base), &[w.clone(), c.clone()]),
            stage_digest(&reversed, Some(&base), &[c, w]),
        );
    }

    #[test]
    fn test_artifact_digests_differ_per_output() {
        let stage = Digest::of_bytes(b"stage");
        let venv = ArtifactOutput {
            name: "venv".into(),
            path: "/opt/venv".into(),
        };
        let i18n = ArtifactOutput {
            name: "translations".into(),
            path: "/i18n".into(),
        };
        assert_ne!(artifact_digest(&stage, &venv), artifact_digest(&stage, &i18n));
        assert_eq!(artifact_digest(&stage, &venv), artifact_digest(&stage, &venv));
    }
}
