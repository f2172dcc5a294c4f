use std::path::PathBuf;
use std::time::Duration;

use relgate_core::{RevisionId, StageError};
use relgate_tool::{run_ok, CancelToken, ToolInvocation, ToolRunner};

/// Revision plumbing over the `git` subprocess. Only committed revisions
/// are ever handed out; the working tree plays no part in verification.
#[derive(Clone, Debug)]
pub struct GitTree {
    pub root: PathBuf,
    pub timeout: Option<Duration>,
}

impl GitTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn git(&self, args: &[&str]) -> ToolInvocation {
        ToolInvocation::new("git")
            .args(args.iter().map(|s| s.to_string()))
            .cwd(&self.root)
            .timeout(self.timeout)
    }

    pub fn is_versioned(
        &self,
        runner: &dyn ToolRunner,
        cancel: &CancelToken,
    ) -> Result<bool, StageError> {
        let out = runner.run(&self.git(&["rev-parse", "--git-dir"]), cancel)?;
        Ok(out.success())
    }

    /// Resolve a revspec to exactly one commit object. `NotAVersionedTree`
    /// when there is no history at all, `ToolError` for an unknown revspec.
    pub fn resolve(
        &self,
        runner: &dyn ToolRunner,
        cancel: &CancelToken,
        revspec: &str,
    ) -> Result<RevisionId, StageError> {
        if !self.is_versioned(runner, cancel)? {
            return Err(StageError::NotAVersionedTree);
        }
        let spec = format!("{}^{{commit}}", revspec);
        let sha = run_ok(runner, &self.git(&["rev-parse", "--verify", &spec]), cancel)?;
        Ok(RevisionId::from_str(sha))
    }

    /// The committed tip, for callers that explicitly request HEAD resolution.
    pub fn head(
        &self,
        runner: &dyn ToolRunner,
        cancel: &CancelToken,
    ) -> Result<RevisionId, StageError> {
        self.resolve(runner, cancel, "HEAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{commit_file, init_git_repo};
    use relgate_tool::ProcessRunner;
    use tempfile::tempdir;

    #[test]
    fn head_resolves_to_a_full_sha() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        let tree = GitTree::new(dir.path());
        let head = tree.head(&ProcessRunner::new(), &CancelToken::new()).unwrap();
        assert_eq!(head.as_str().len(), 40);
    }

    #[test]
    fn resolves_a_non_head_revision_to_its_own_sha() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        let first = commit_file(dir.path(), "a.txt", "one", "add a").unwrap();
        commit_file(dir.path(), "a.txt", "two", "update a").unwrap();

        let tree = GitTree::new(dir.path());
        let cancel = CancelToken::new();
        let runner = ProcessRunner::new();
        let resolved = tree.resolve(&runner, &cancel, &first).unwrap();
        assert_eq!(resolved.as_str(), first);
        assert_ne!(resolved, tree.head(&runner, &cancel).unwrap());
    }

    #[test]
    fn unversioned_directory_is_distinguished() {
        let dir = tempdir().unwrap();
        let tree = GitTree::new(dir.path());
        let err = tree.head(&ProcessRunner::new(), &CancelToken::new()).unwrap_err();
        assert_eq!(err, StageError::NotAVersionedTree);
    }

    #[test]
    fn unknown_revspec_is_a_tool_error_not_not_a_versioned_tree() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        let tree = GitTree::new(dir.path());
        let err = tree
            .resolve(&ProcessRunner::new(), &CancelToken::new(), "no-such-rev")
            .unwrap_err();
        assert!(matches!(err, StageError::ToolError(_)));
    }
}
