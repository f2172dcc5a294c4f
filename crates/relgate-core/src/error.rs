use thiserror::Error;

/// Stage-level failure taxonomy. Signature `Invalid`/`Unknown` are not
/// errors; they are `VerificationResult` variants carried in the outcome.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("dependency lock mismatch: {0}")]
    LockMismatch(String),

    #[error("source tree has no revision history")]
    NotAVersionedTree,

    #[error("unresolvable dependency: {0}")]
    UnresolvableDependency(String),

    #[error("vulnerability database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("external tool failed: {0}")]
    ToolError(String),

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Short machine-readable tag used in per-stage status lines.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::BuildFailed(_) => "build_failed",
            StageError::LockMismatch(_) => "lock_mismatch",
            StageError::NotAVersionedTree => "not_a_versioned_tree",
            StageError::UnresolvableDependency(_) => "unresolvable_dependency",
            StageError::DatabaseUnavailable(_) => "database_unavailable",
            StageError::Timeout(_) => "timeout",
            StageError::ToolError(_) => "tool_error",
            StageError::Cancelled => "cancelled",
        }
    }
}
