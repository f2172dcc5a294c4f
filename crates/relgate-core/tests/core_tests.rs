use relgate_core::{
    Artifact, ExitClass, Finding, PipelineRun, RevisionId, RunId, Severity, StageError,
    StageName, StageReport, StageStatus, VerificationOutcome, VerificationResult, overall_exit,
};

#[test]
fn test_run_id_new() {
    let a = RunId::new();
    let b = RunId::new();
    assert_ne!(a, b);
}

#[test]
fn test_stage_report_status_line() {
    let report = StageReport::failed(StageName::Build, "compiler exit 1");
    let line = report.status_line();
    assert!(line.contains("stage=build"));
    assert!(line.contains("status=failed"));
    assert!(line.contains("compiler exit 1"));
}

#[test]
fn test_pipeline_run_accumulates_reports() {
    let mut run = PipelineRun::new(RunId::new());
    run.reports.push(StageReport::succeeded(StageName::Build));
    run.reports.push(StageReport::skipped(StageName::Scan, "dependency build failed"));
    assert_eq!(run.report_for(StageName::Build).unwrap().status, StageStatus::Succeeded);
    assert_eq!(run.report_for(StageName::Scan).unwrap().status, StageStatus::Skipped);
    assert!(run.report_for(StageName::Verify).is_none());
}

#[test]
fn test_verification_outcome_is_bound_to_revision() {
    let outcome = VerificationOutcome {
        revision: RevisionId::from_str("abc123"),
        result: VerificationResult::Unknown("no trust material configured".into()),
    };
    assert_eq!(outcome.revision.as_str(), "abc123");
    assert!(outcome.result.summary().starts_with("unknown:"));
}

#[test]
fn test_artifact_serializes() {
    let artifact = Artifact {
        path: "/tmp/out/app-1.1.5".into(),
        version: "1.1.5".into(),
        digest: "deadbeef".into(),
    };
    let json = serde_json::to_string(&artifact).unwrap();
    let back: Artifact = serde_json::from_str(&json).unwrap();
    assert_eq!(back.version, "1.1.5");
}

#[test]
fn test_finding_severity_deserializes_lowercase() {
    let f: Finding = serde_json::from_str(
        r#"{"component":"openssl","installed":"3.0.1","advisory":"CVE-2024-1234","severity":"critical"}"#,
    )
    .unwrap();
    assert_eq!(f.severity, Severity::Critical);
}

#[test]
fn test_timeout_distinct_from_tool_error() {
    assert_ne!(StageError::Timeout(30).kind(), StageError::ToolError("exit 1".into()).kind());
}

#[test]
fn test_empty_report_set_is_success() {
    assert_eq!(overall_exit(&[], &[StageName::Build]), ExitClass::Success);
}
