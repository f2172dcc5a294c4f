use crate::{Finding, Severity, StageName, StageReport, StageStatus};

/// Stages whose output a stage consumes. Sbom and Scan read the Artifact,
/// so they join on Build; Verify is independent and may run alongside it.
pub fn stage_dependencies(stage: StageName) -> &'static [StageName] {
    match stage {
        StageName::Build | StageName::Verify => &[],
        StageName::Sbom | StageName::Scan => &[StageName::Build],
    }
}

/// Whether `stage` must be skipped given the reports of already-finished
/// stages. Returns the reason when a dependency did not succeed.
pub fn skip_reason(stage: StageName, finished: &[StageReport]) -> Option<String> {
    for dep in stage_dependencies(stage) {
        let report = finished.iter().find(|r| r.stage == *dep)?;
        if report.status != StageStatus::Succeeded {
            return Some(format!(
                "dependency {} {}",
                dep.as_str(),
                report.status.as_str()
            ));
        }
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Non-required stages failed; recorded, but the run still passes.
    AdvisoryFailures,
    Failed,
}

impl ExitClass {
    pub fn code(&self) -> i32 {
        match self {
            ExitClass::Success | ExitClass::AdvisoryFailures => 0,
            ExitClass::Failed => 1,
        }
    }
}

/// Overall run status: `Failed` iff any required stage failed. A skipped
/// required stage counts as failed (its dependency made it unrunnable).
pub fn overall_exit(reports: &[StageReport], required: &[StageName]) -> ExitClass {
    let mut advisory = false;
    for report in reports {
        match report.status {
            StageStatus::Failed | StageStatus::Skipped => {
                if required.contains(&report.stage) {
                    return ExitClass::Failed;
                }
                if report.status == StageStatus::Failed {
                    advisory = true;
                }
            }
            _ => {}
        }
    }
    if advisory {
        ExitClass::AdvisoryFailures
    } else {
        ExitClass::Success
    }
}

/// Strict-mode gate: does any finding meet or exceed the threshold?
pub fn meets_threshold(findings: &[Finding], threshold: Severity) -> bool {
    findings.iter().any(|f| f.severity >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> Finding {
        Finding {
            component: "libx".into(),
            installed: "1.0.0".into(),
            advisory: "CVE-2024-0001".into(),
            severity,
        }
    }

    #[test]
    fn sbom_and_scan_depend_on_build() {
        assert_eq!(stage_dependencies(StageName::Sbom), &[StageName::Build]);
        assert_eq!(stage_dependencies(StageName::Scan), &[StageName::Build]);
        assert!(stage_dependencies(StageName::Verify).is_empty());
    }

    #[test]
    fn failed_build_skips_dependents() {
        let finished = vec![StageReport::failed(StageName::Build, "compiler exit 1")];
        assert_eq!(
            skip_reason(StageName::Sbom, &finished),
            Some("dependency build failed".to_string())
        );
        assert_eq!(skip_reason(StageName::Verify, &finished), None);
    }

    #[test]
    fn succeeded_build_unblocks_dependents() {
        let finished = vec![StageReport::succeeded(StageName::Build)];
        assert_eq!(skip_reason(StageName::Scan, &finished), None);
    }

    #[test]
    fn required_failure_fails_run() {
        let reports = vec![
            StageReport::succeeded(StageName::Build),
            StageReport::failed(StageName::Verify, "invalid"),
        ];
        assert_eq!(overall_exit(&reports, &[StageName::Build, StageName::Verify]), ExitClass::Failed);
    }

    #[test]
    fn advisory_failure_does_not_fail_run() {
        let reports = vec![
            StageReport::succeeded(StageName::Build),
            StageReport::failed(StageName::Verify, "unknown: no trust material"),
        ];
        assert_eq!(overall_exit(&reports, &[StageName::Build]), ExitClass::AdvisoryFailures);
    }

    #[test]
    fn skipped_required_stage_fails_run() {
        let reports = vec![
            StageReport::failed(StageName::Build, "compiler exit 1"),
            StageReport::skipped(StageName::Sbom, "dependency build failed"),
        ];
        assert_eq!(overall_exit(&reports, &[StageName::Sbom]), ExitClass::Failed);
    }

    #[test]
    fn threshold_gate() {
        let findings = vec![finding(Severity::Medium), finding(Severity::Critical)];
        assert!(meets_threshold(&findings, Severity::High));
        assert!(!meets_threshold(&findings[..1].to_vec(), Severity::High));
        assert!(!meets_threshold(&[], Severity::Low));
    }
}
