use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use relgate_core::{Finding, StageError};
use relgate_tool::{CancelToken, ToolInvocation, ToolRunner};
use tracing::{debug, info, warn};

/// What a scan target is: the compiled artifact or the declared source
/// dependency graph. Both carry the path the database client reads.
#[derive(Clone, Debug)]
pub enum ScanTarget {
    Artifact(PathBuf),
    SourceDependencyGraph(PathBuf),
}

impl ScanTarget {
    pub fn path(&self) -> &Path {
        match self {
            ScanTarget::Artifact(p) | ScanTarget::SourceDependencyGraph(p) => p,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanTarget::Artifact(_) => "artifact",
            ScanTarget::SourceDependencyGraph(_) => "source",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScanOutcome {
    /// Ordered as the database client reported them; empty is a valid,
    /// non-error outcome.
    pub findings: Vec<Finding>,
    pub degraded: Vec<String>,
}

/// Drives the external vulnerability database client. Scanning is
/// read-only; the only write is the cache refresh, and only once the cache
/// is older than `max_cache_age`.
pub struct VulnerabilityScanner {
    runner: Arc<dyn ToolRunner>,
    /// Scan argv with an `{input}` placeholder; findings arrive as a JSON
    /// array on stdout.
    command: Vec<String>,
    refresh_command: Option<Vec<String>>,
    cache_dir: PathBuf,
    max_cache_age: Duration,
    timeout: Option<Duration>,
}

impl VulnerabilityScanner {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        command: Vec<String>,
        refresh_command: Option<Vec<String>>,
        cache_dir: PathBuf,
        max_cache_age: Duration,
    ) -> Self {
        Self { runner, command, refresh_command, cache_dir, max_cache_age, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn marker_path(&self) -> PathBuf {
        self.cache_dir.join("last-refresh")
    }

    fn cache_is_fresh(&self) -> bool {
        let Ok(meta) = std::fs::metadata(self.marker_path()) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < self.max_cache_age,
            Err(_) => true,
        }
    }

    fn cache_exists(&self) -> bool {
        self.marker_path().exists()
    }

    /// Refresh the feed if stale. With a usable (if old) cache on disk a
    /// failed refresh degrades; with no cache at all it is
    /// `DatabaseUnavailable`.
    fn ensure_database(&self, cancel: &CancelToken, degraded: &mut Vec<String>) -> Result<(), StageError> {
        if self.cache_is_fresh() {
            debug!("vulnerability database cache is fresh");
            return Ok(());
        }
        let Some(refresh) = &self.refresh_command else {
            if self.cache_exists() {
                return Ok(());
            }
            return Err(StageError::DatabaseUnavailable(
                "no cache present and no refresh command configured".into(),
            ));
        };

        let inv = ToolInvocation::from_argv(refresh)
            .ok_or_else(|| StageError::DatabaseUnavailable("empty refresh command".into()))?
            .timeout(self.timeout);
        match self.runner.run(&inv, cancel) {
            Ok(out) if out.success() => {
                std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
                    StageError::DatabaseUnavailable(format!("create cache dir: {}", e))
                })?;
                std::fs::write(self.marker_path(), b"").map_err(|e| {
                    StageError::DatabaseUnavailable(format!("touch cache marker: {}", e))
                })?;
                info!("vulnerability database refreshed");
                Ok(())
            }
            Ok(out) => self.degrade_or_fail(out.stderr_excerpt(), degraded),
            Err(e @ (StageError::Timeout(_) | StageError::Cancelled)) => Err(e),
            Err(e) => self.degrade_or_fail(e.to_string(), degraded),
        }
    }

    fn degrade_or_fail(
        &self,
        detail: String,
        degraded: &mut Vec<String>,
    ) -> Result<(), StageError> {
        if self.cache_exists() {
            warn!(detail = %detail, "database refresh failed, scanning against stale cache");
            degraded.push(format!("database refresh failed, using stale cache: {}", detail));
            Ok(())
        } else {
            Err(StageError::DatabaseUnavailable(detail))
        }
    }

    pub fn scan(&self, target: &ScanTarget, cancel: &CancelToken) -> Result<ScanOutcome, StageError> {
        let mut outcome = ScanOutcome::default();
        self.ensure_database(cancel, &mut outcome.degraded)?;

        let argv: Vec<String> = self
            .command
            .iter()
            .map(|a| a.replace("{input}", &target.path().display().to_string()))
            .collect();
        let inv = ToolInvocation::from_argv(&argv)
            .ok_or_else(|| StageError::ToolError("empty scan command".into()))?
            .timeout(self.timeout);

        let out = self.runner.run(&inv, cancel)?;
        if !out.success() {
            return Err(StageError::ToolError(format!(
                "scanner exited with {:?}: {}",
                out.code,
                out.stderr_excerpt()
            )));
        }

        outcome.findings = serde_json::from_slice(&out.stdout)
            .map_err(|e| StageError::ToolError(format!("malformed scanner output: {}", e)))?;
        info!(target = target.as_str(), findings = outcome.findings.len(), "scan finished");
        Ok(outcome)
    }
}
