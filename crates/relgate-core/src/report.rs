use serde::{Deserialize, Serialize};

use crate::{
    Artifact, Finding, RunId, SbomDocument, StageName, StageStatus, VerificationOutcome,
};

/// One line of structured status per stage. No stage is silently dropped:
/// every selected stage ends up with exactly one report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageName,
    pub status: StageStatus,
    pub reason: Option<String>,
}

impl StageReport {
    pub fn succeeded(stage: StageName) -> Self {
        Self { stage, status: StageStatus::Succeeded, reason: None }
    }

    pub fn succeeded_with(stage: StageName, reason: impl Into<String>) -> Self {
        Self { stage, status: StageStatus::Succeeded, reason: Some(reason.into()) }
    }

    pub fn failed(stage: StageName, reason: impl Into<String>) -> Self {
        Self { stage, status: StageStatus::Failed, reason: Some(reason.into()) }
    }

    pub fn skipped(stage: StageName, reason: impl Into<String>) -> Self {
        Self { stage, status: StageStatus::Skipped, reason: Some(reason.into()) }
    }

    pub fn status_line(&self) -> String {
        format!(
            "stage={} status={} reason={:?}",
            self.stage.as_str(),
            self.status.as_str(),
            self.reason.as_deref().unwrap_or("-")
        )
    }
}

/// Everything one invocation produced. Created per run, discarded after the
/// exit code is emitted; no run-to-run state is retained.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Option<RunId>,
    pub reports: Vec<StageReport>,
    pub artifact: Option<Artifact>,
    pub verification: Option<VerificationOutcome>,
    pub documents: Vec<SbomDocument>,
    pub findings: Vec<Finding>,
    /// Partial-failure records from Sbom/Scan (unresolvable dependencies,
    /// stale vulnerability feeds). Degraded, not fatal.
    pub degraded: Vec<String>,
}

impl PipelineRun {
    pub fn new(id: RunId) -> Self {
        Self { id: Some(id), ..Default::default() }
    }

    pub fn report_for(&self, stage: StageName) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }
}
