use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relgate_core::{Artifact, SourceTree, StageError};
use relgate_tool::{CancelToken, ToolInvocation, ToolRunner};
use tracing::{debug, info};

use crate::digest_file;

/// How to invoke the pinned compiler. `command` is argv with `{version}`,
/// `{toolchain}` and `{output}` placeholders; the same values are also
/// exported as RELGATE_VERSION / RELGATE_TOOLCHAIN / RELGATE_OUTPUT for
/// build scripts that prefer the environment.
#[derive(Clone, Debug)]
pub struct BuildPlan {
    pub command: Vec<String>,
    /// Dependency lock relative to the source root. Its presence is the
    /// precondition for a hermetic build.
    pub lockfile: PathBuf,
    /// Exact toolchain version, never "latest".
    pub toolchain: String,
    pub out_dir: PathBuf,
    pub artifact_name: String,
    /// Stderr marker the compiler emits when the lock does not cover all
    /// imports (e.g. cargo's "needs to be updated but --locked was passed").
    pub lock_error_marker: Option<String>,
    /// Argument for the artifact's version-query entry point.
    pub version_arg: String,
    pub timeout: Option<Duration>,
}

pub struct ArtifactBuilder {
    runner: Arc<dyn ToolRunner>,
    plan: BuildPlan,
}

impl ArtifactBuilder {
    pub fn new(runner: Arc<dyn ToolRunner>, plan: BuildPlan) -> Self {
        Self { runner, plan }
    }

    /// Version-addressed output path: `{out_dir}/{artifact_name}-{version}`.
    pub fn output_path(&self, version: &str) -> PathBuf {
        self.plan.out_dir.join(format!("{}-{}", self.plan.artifact_name, version))
    }

    pub fn build(
        &self,
        tree: &SourceTree,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<Artifact, StageError> {
        if version.is_empty() {
            return Err(StageError::BuildFailed("version must be non-empty".into()));
        }

        let lock = tree.root.join(&self.plan.lockfile);
        if !lock.exists() {
            return Err(StageError::LockMismatch(format!(
                "missing dependency lock {}",
                lock.display()
            )));
        }

        let output = self.output_path(version);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::ToolError(format!("create {}: {}", parent.display(), e)))?;
        }

        let argv: Vec<String> = self
            .plan
            .command
            .iter()
            .map(|a| {
                a.replace("{version}", version)
                    .replace("{toolchain}", &self.plan.toolchain)
                    .replace("{output}", &output.display().to_string())
            })
            .collect();
        let inv = ToolInvocation::from_argv(&argv)
            .ok_or_else(|| StageError::BuildFailed("empty build command".into()))?
            .cwd(&tree.root)
            .env("RELGATE_VERSION", version)
            .env("RELGATE_TOOLCHAIN", self.plan.toolchain.as_str())
            .env("RELGATE_OUTPUT", output.display().to_string())
            // pin the embedded timestamp so rebuilds are byte-identical
            .env("SOURCE_DATE_EPOCH", "0")
            .timeout(self.plan.timeout);

        debug!(version, toolchain = %self.plan.toolchain, "invoking compiler");
        let out = self.runner.run(&inv, cancel)?;
        if !out.success() {
            let excerpt = out.stderr_excerpt();
            if let Some(marker) = &self.plan.lock_error_marker {
                if out.stderr_text().contains(marker.as_str()) {
                    return Err(StageError::LockMismatch(excerpt));
                }
            }
            return Err(StageError::BuildFailed(excerpt));
        }

        if !output.exists() {
            return Err(StageError::BuildFailed(format!(
                "build command did not produce {}",
                output.display()
            )));
        }

        self.check_embedded_version(&output, version, cancel)?;

        let digest = digest_file(&output)?;
        info!(path = %output.display(), digest = %digest, "artifact built");
        Ok(Artifact { path: output, version: version.to_string(), digest })
    }

    /// The artifact must report the declared version through its own
    /// version-query entry point.
    fn check_embedded_version(
        &self,
        artifact: &PathBuf,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<(), StageError> {
        let inv = ToolInvocation::new(artifact.display().to_string())
            .arg(self.plan.version_arg.as_str())
            .timeout(self.plan.timeout);
        let out = self.runner.run(&inv, cancel)?;
        let reported = out.stdout_text();
        if !out.success() || !reported.contains(version) {
            return Err(StageError::BuildFailed(format!(
                "artifact reports version {:?}, expected {:?}",
                reported, version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_tool::{FnRunner, ToolOutput};
    use tempfile::tempdir;

    fn plan(out_dir: PathBuf) -> BuildPlan {
        BuildPlan {
            command: vec!["cc".into(), "-o".into(), "{output}".into()],
            lockfile: "deps.lock".into(),
            toolchain: "1.74.0".into(),
            out_dir,
            artifact_name: "app".into(),
            lock_error_marker: Some("lock file".into()),
            version_arg: "--version".into(),
            timeout: None,
        }
    }

    fn source_tree(with_lock: bool) -> (tempfile::TempDir, SourceTree) {
        let dir = tempdir().unwrap();
        if with_lock {
            std::fs::write(dir.path().join("deps.lock"), "locked").unwrap();
        }
        let tree = SourceTree::new(dir.path());
        (dir, tree)
    }

    #[test]
    fn missing_lock_is_lock_mismatch_before_any_tool_runs() {
        let (dir, tree) = source_tree(false);
        let runner = Arc::new(FnRunner::new(|_inv| Ok(ToolOutput::ok(""))));
        let builder = ArtifactBuilder::new(runner.clone(), plan(dir.path().join("out")));
        let err = builder.build(&tree, "1.1.5", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StageError::LockMismatch(_)));
        assert_eq!(runner.call_count(), 0);
    }

    #[test]
    fn compiler_failure_carries_a_stderr_excerpt() {
        let (dir, tree) = source_tree(true);
        let runner = Arc::new(FnRunner::new(|_inv| {
            Ok(ToolOutput::failed(1, "error: expected `;`\ncompilation aborted"))
        }));
        let builder = ArtifactBuilder::new(runner, plan(dir.path().join("out")));
        let err = builder.build(&tree, "1.1.5", &CancelToken::new()).unwrap_err();
        match err {
            StageError::BuildFailed(excerpt) => assert!(excerpt.contains("compilation aborted")),
            other => panic!("expected BuildFailed, got {:?}", other),
        }
    }

    #[test]
    fn lock_marker_in_stderr_is_lock_mismatch() {
        let (dir, tree) = source_tree(true);
        let runner = Arc::new(FnRunner::new(|_inv| {
            Ok(ToolOutput::failed(101, "the lock file needs to be updated"))
        }));
        let builder = ArtifactBuilder::new(runner, plan(dir.path().join("out")));
        let err = builder.build(&tree, "1.1.5", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StageError::LockMismatch(_)));
    }

    #[test]
    fn successful_build_digests_and_checks_the_version() {
        let (dir, tree) = source_tree(true);
        let out_dir = dir.path().join("out");
        let runner = Arc::new(FnRunner::new(|inv: &ToolInvocation| {
            if inv.program == "cc" {
                // the compiler writes the artifact at {output}
                let output = inv.args.last().unwrap();
                std::fs::write(output, b"artifact bytes").unwrap();
                Ok(ToolOutput::ok(""))
            } else {
                // the artifact answers its version query
                Ok(ToolOutput::ok("app 1.1.5"))
            }
        }));
        let builder = ArtifactBuilder::new(runner.clone(), plan(out_dir.clone()));
        let cancel = CancelToken::new();

        let first = builder.build(&tree, "1.1.5", &cancel).unwrap();
        assert_eq!(first.path, out_dir.join("app-1.1.5"));
        assert_eq!(first.version, "1.1.5");

        // reproducibility: a second build from the same inputs agrees byte-for-byte
        let second = builder.build(&tree, "1.1.5", &cancel).unwrap();
        assert_eq!(first.digest, second.digest);

        let cc_calls = runner.calls_to("cc");
        assert!(cc_calls.iter().all(|inv| {
            inv.env.iter().any(|(k, v)| k == "RELGATE_VERSION" && v == "1.1.5")
                && inv.env.iter().any(|(k, v)| k == "SOURCE_DATE_EPOCH" && v == "0")
        }));
    }

    #[test]
    fn version_mismatch_fails_the_build() {
        let (dir, tree) = source_tree(true);
        let runner = Arc::new(FnRunner::new(|inv: &ToolInvocation| {
            if inv.program == "cc" {
                std::fs::write(inv.args.last().unwrap(), b"bytes").unwrap();
                Ok(ToolOutput::ok(""))
            } else {
                Ok(ToolOutput::ok("app 0.9.9"))
            }
        }));
        let builder = ArtifactBuilder::new(runner, plan(dir.path().join("out")));
        let err = builder.build(&tree, "1.1.5", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StageError::BuildFailed(_)));
    }

    #[test]
    fn empty_version_is_rejected() {
        let (dir, tree) = source_tree(true);
        let runner = Arc::new(FnRunner::new(|_inv| Ok(ToolOutput::ok(""))));
        let builder = ArtifactBuilder::new(runner, plan(dir.path().join("out")));
        let err = builder.build(&tree, "", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, StageError::BuildFailed(_)));
    }
}
