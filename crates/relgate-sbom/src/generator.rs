use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relgate_core::{document_filename, SbomDocument, SbomFormat, SbomSubject, StageError};
use relgate_tool::{CancelToken, ToolInvocation, ToolRunner};
use tracing::{info, warn};

/// Stderr prefix under which the SBOM engine names dependencies it could
/// not resolve. Each such line degrades the document, it never blocks it.
const UNRESOLVED_MARKER: &str = "unresolved dependency:";

/// What one `generate` call produced: the documents that landed at their
/// deterministic paths plus the degraded items recorded along the way.
#[derive(Clone, Debug, Default)]
pub struct GenerateReport {
    pub documents: Vec<SbomDocument>,
    pub degraded: Vec<String>,
}

/// Drives the external SBOM engine once per (subject, format). `command`
/// is argv with `{input}`, `{format}` and `{output}` placeholders.
pub struct SbomGenerator {
    runner: Arc<dyn ToolRunner>,
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl SbomGenerator {
    pub fn new(runner: Arc<dyn ToolRunner>, command: Vec<String>) -> Self {
        Self { runner, command, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate one document per requested format. A failing format is
    /// recorded as degraded and the remaining formats still run; timeouts
    /// and cancellation abort the whole stage, and so does an engine that
    /// produces no document at all. The engine writes to a temporary path
    /// that is renamed into place only on success, so an aborted run never
    /// leaves a partial file at the deterministic path.
    pub fn generate(
        &self,
        subject: SbomSubject,
        subject_path: &Path,
        formats: &[SbomFormat],
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<GenerateReport, StageError> {
        std::fs::create_dir_all(output_dir)
            .map_err(|e| StageError::ToolError(format!("create {}: {}", output_dir.display(), e)))?;

        let mut report = GenerateReport::default();
        let mut last_error = None;
        for format in formats {
            match self.generate_one(subject, subject_path, *format, output_dir, cancel) {
                Ok((document, mut degraded)) => {
                    report.documents.push(document);
                    report.degraded.append(&mut degraded);
                }
                Err(e @ (StageError::Timeout(_) | StageError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(subject = subject.as_str(), format = format.as_str(), error = %e, "document generation degraded");
                    report
                        .degraded
                        .push(format!("{}: {}", document_filename(subject, *format), e));
                    last_error = Some(e);
                }
            }
        }
        // partial success needs at least one document to show for it
        if report.documents.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(report)
    }

    fn generate_one(
        &self,
        subject: SbomSubject,
        subject_path: &Path,
        format: SbomFormat,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(SbomDocument, Vec<String>), StageError> {
        let filename = document_filename(subject, format);
        let final_path = output_dir.join(&filename);
        let tmp_path = output_dir.join(format!(".{}.tmp", filename));

        let result = self.run_engine(subject_path, format, &tmp_path, cancel);
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        let degraded = result?;

        std::fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            StageError::ToolError(format!("finalize {}: {}", final_path.display(), e))
        })?;
        info!(path = %final_path.display(), "sbom document written");

        Ok((SbomDocument { subject, format, path: final_path }, degraded))
    }

    fn run_engine(
        &self,
        subject_path: &Path,
        format: SbomFormat,
        tmp_path: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, StageError> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|a| {
                a.replace("{input}", &subject_path.display().to_string())
                    .replace("{format}", format.as_str())
                    .replace("{output}", &tmp_path.display().to_string())
            })
            .collect();
        let inv = ToolInvocation::from_argv(&argv)
            .ok_or_else(|| StageError::ToolError("empty sbom command".into()))?
            .timeout(self.timeout);

        let out = self.runner.run(&inv, cancel)?;
        if !out.success() {
            return Err(StageError::ToolError(format!(
                "sbom engine exited with {:?}: {}",
                out.code,
                out.stderr_excerpt()
            )));
        }
        if !tmp_path.exists() {
            return Err(StageError::ToolError(format!(
                "sbom engine produced no output at {}",
                tmp_path.display()
            )));
        }

        // partial success: unresolved dependencies degrade, they don't block
        let degraded = out
            .stderr_text()
            .lines()
            .filter_map(|line| line.strip_prefix(UNRESOLVED_MARKER))
            .map(|name| StageError::UnresolvableDependency(name.trim().to_string()).to_string())
            .collect();
        Ok(degraded)
    }
}
