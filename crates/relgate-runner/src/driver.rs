use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::info;

use relgate_build::{ArtifactBuilder, BuildPlan};
use relgate_core::{
    skip_reason, Artifact, PipelineRun, RunId, SbomDocument, SourceTree, StageError, StageName,
    StageReport, VerificationOutcome, VerificationResult,
};
use relgate_provenance::{
    GitTree, GpgTrustStore, ProvenanceVerifier, SignerIdentity, TrustAnchor,
};
use relgate_sbom::SbomGenerator;
use relgate_scan::{ScanOutcome, ScanTarget, VulnerabilityScanner};
use relgate_tool::{CancelToken, ProcessRunner, ToolRunner};

use crate::Config;

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Release version; required when Build is selected.
    pub version: Option<String>,
    /// Revision to verify; defaults to the committed tip.
    pub revision: Option<String>,
    /// Pre-built artifact for Sbom/Scan runs that do not include Build.
    pub artifact: Option<PathBuf>,
    /// Overrides `sbom.output_dir` from config.
    pub output_dir: Option<PathBuf>,
    /// Stages required for this run, in addition to `stages.required`.
    pub require: Vec<StageName>,
}

/// Sequences the stages and owns all cross-stage state for one run.
/// Build and Verify have no data dependency and run concurrently; Sbom and
/// Scan join on Build's artifact and then run concurrently with each other.
pub struct Driver {
    pub repo_root: PathBuf,
    pub cfg: Config,
    pub runner: Arc<dyn ToolRunner>,
    pub cancel: CancelToken,
}

impl Driver {
    pub fn open(repo_root: PathBuf) -> Result<Self> {
        let cfg_path = Config::config_path(&repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
            Config::default_for_repo(project_id)
        };
        Ok(Self::new(repo_root, cfg, Arc::new(ProcessRunner::new())))
    }

    pub fn new(repo_root: PathBuf, cfg: Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self { repo_root, cfg, runner, cancel: CancelToken::new() }
    }

    pub fn init_repo(repo_root: &std::path::Path) -> Result<()> {
        let cfg_path = Config::config_path(repo_root);
        if !cfg_path.exists() {
            let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
            Config::default_for_repo(project_id).save_to(&cfg_path)?;
        }
        Ok(())
    }

    pub fn required_stages(&self, opts: &RunOptions) -> Result<Vec<StageName>> {
        let mut required = self.cfg.required_stages()?;
        for stage in &opts.require {
            if !required.contains(stage) {
                required.push(*stage);
            }
        }
        Ok(required)
    }

    pub fn run(&self, stages: &[StageName], opts: &RunOptions) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(RunId::new());
        let tree = SourceTree::new(&self.repo_root);

        let selected = |s: StageName| stages.contains(&s);
        if selected(StageName::Build) && opts.version.is_none() {
            return Err(anyhow!("build stage requires a version"));
        }

        // Build and Verify are independent and run concurrently.
        let mut build_result: Option<Result<Artifact, StageError>> = None;
        let mut verify_result: Option<Result<VerificationOutcome, StageError>> = None;
        thread::scope(|s| {
            let build = selected(StageName::Build).then(|| {
                s.spawn(|| self.exec_build(&tree, opts.version.as_deref().unwrap_or_default()))
            });
            let verify = selected(StageName::Verify)
                .then(|| s.spawn(|| self.exec_verify(opts.revision.as_deref())));
            if let Some(handle) = build {
                build_result = Some(join_stage(handle, StageName::Build));
            }
            if let Some(handle) = verify {
                verify_result = Some(join_stage(handle, StageName::Verify));
            }
        });

        if let Some(result) = build_result {
            let report = match result {
                Ok(artifact) => {
                    run.artifact = Some(artifact);
                    StageReport::succeeded(StageName::Build)
                }
                Err(e) => StageReport::failed(StageName::Build, e.to_string()),
            };
            self.emit(&mut run, report);
        }
        if let Some(result) = verify_result {
            let report = match result {
                Ok(outcome) => {
                    let report = match &outcome.result {
                        VerificationResult::Valid => {
                            StageReport::succeeded_with(StageName::Verify, "signature valid")
                        }
                        VerificationResult::Invalid => {
                            StageReport::failed(StageName::Verify, "signature invalid")
                        }
                        VerificationResult::Unknown(reason) => {
                            StageReport::failed(StageName::Verify, format!("unknown: {}", reason))
                        }
                    };
                    run.verification = Some(outcome);
                    report
                }
                Err(e) => StageReport::failed(StageName::Verify, e.to_string()),
            };
            self.emit(&mut run, report);
        }

        // Join point: Sbom and Scan read the artifact.
        let artifact_path = self.artifact_path(&run, opts, selected(StageName::Build));
        let mut sbom_result = None;
        let mut scan_result = None;
        let tree = &tree;
        thread::scope(|s| {
            let sbom = selected(StageName::Sbom)
                .then(|| self.gate_dependents(StageName::Sbom, &run, &artifact_path))
                .flatten()
                .map(|path| s.spawn(move || self.exec_sbom(&tree, &path, opts)));
            let scan = selected(StageName::Scan)
                .then(|| self.gate_dependents(StageName::Scan, &run, &artifact_path))
                .flatten()
                .map(|path| s.spawn(move || self.exec_scan(&tree, &path)));
            if let Some(handle) = sbom {
                sbom_result = Some(join_stage(handle, StageName::Sbom));
            }
            if let Some(handle) = scan {
                scan_result = Some(join_stage(handle, StageName::Scan));
            }
        });

        if selected(StageName::Sbom) {
            let report = match sbom_result {
                Some(Ok((documents, mut degraded))) => {
                    let report = StageReport::succeeded_with(
                        StageName::Sbom,
                        format!("{} documents", documents.len()),
                    );
                    run.documents = documents;
                    run.degraded.append(&mut degraded);
                    report
                }
                Some(Err(e)) => StageReport::failed(StageName::Sbom, e.to_string()),
                None => self.skipped_report(StageName::Sbom, &run, &artifact_path),
            };
            self.emit(&mut run, report);
        }
        if selected(StageName::Scan) {
            let report = match scan_result {
                Some(Ok(outcome)) => {
                    let report = StageReport::succeeded_with(
                        StageName::Scan,
                        format!("{} findings", outcome.findings.len()),
                    );
                    run.findings = outcome.findings;
                    run.degraded.extend(outcome.degraded);
                    report
                }
                Some(Err(e)) => StageReport::failed(StageName::Scan, e.to_string()),
                None => self.skipped_report(StageName::Scan, &run, &artifact_path),
            };
            self.emit(&mut run, report);
        }

        Ok(run)
    }

    /// The artifact Sbom/Scan should read: this run's build output, or a
    /// pre-built one passed by the caller. None means the dependency is
    /// unsatisfied and dependents must be skipped, never handed a
    /// nonexistent path.
    fn artifact_path(
        &self,
        run: &PipelineRun,
        opts: &RunOptions,
        build_selected: bool,
    ) -> Option<PathBuf> {
        if build_selected {
            return run.artifact.as_ref().map(|a| a.path.clone());
        }
        opts.artifact.clone().filter(|p| p.exists())
    }

    fn gate_dependents(
        &self,
        stage: StageName,
        run: &PipelineRun,
        artifact_path: &Option<PathBuf>,
    ) -> Option<PathBuf> {
        if self.cancel.is_cancelled() || skip_reason(stage, &run.reports).is_some() {
            return None;
        }
        artifact_path.clone()
    }

    fn skipped_report(
        &self,
        stage: StageName,
        run: &PipelineRun,
        artifact_path: &Option<PathBuf>,
    ) -> StageReport {
        if self.cancel.is_cancelled() {
            return StageReport::skipped(stage, "cancelled");
        }
        if let Some(reason) = skip_reason(stage, &run.reports) {
            return StageReport::skipped(stage, reason);
        }
        if artifact_path.is_none() {
            return StageReport::skipped(stage, "no artifact available; run build first");
        }
        StageReport::skipped(stage, "not runnable")
    }

    fn emit(&self, run: &mut PipelineRun, report: StageReport) {
        println!("{}", report.status_line());
        info!(stage = report.stage.as_str(), status = report.status.as_str(), "stage finished");
        run.reports.push(report);
    }

    fn exec_build(&self, tree: &SourceTree, version: &str) -> Result<Artifact, StageError> {
        let plan = BuildPlan {
            command: self.cfg.build.command.clone(),
            lockfile: self.cfg.build.lockfile.clone().into(),
            toolchain: self.cfg.build.toolchain.clone(),
            out_dir: self.cfg.out_dir(&self.repo_root),
            artifact_name: self.cfg.build.artifact_name.clone(),
            lock_error_marker: self.cfg.build.lock_error_marker.clone(),
            version_arg: self.cfg.build.version_arg.clone(),
            timeout: self.cfg.build_timeout(),
        };
        ArtifactBuilder::new(self.runner.clone(), plan).build(tree, version, &self.cancel)
    }

    fn exec_verify(&self, revision: Option<&str>) -> Result<VerificationOutcome, StageError> {
        let tree = GitTree::new(&self.repo_root).with_timeout(self.cfg.provenance_timeout());
        let revision = match revision {
            Some(rev) => tree.resolve(self.runner.as_ref(), &self.cancel, rev)?,
            None => tree.head(self.runner.as_ref(), &self.cancel)?,
        };
        let gnupg_home = self
            .cfg
            .provenance
            .gnupg_home
            .as_deref()
            .map(|raw| PathBuf::from(shellexpand::tilde(raw).to_string()));
        let anchor = TrustAnchor {
            signers: self
                .cfg
                .provenance
                .signers
                .iter()
                .map(|s| SignerIdentity {
                    fingerprint: s.fingerprint.clone(),
                    key_path: s.key_path.as_deref().map(PathBuf::from),
                    key_url: s.key_url.clone(),
                })
                .collect(),
        };
        let store = Arc::new(
            GpgTrustStore::new(self.runner.clone(), gnupg_home.clone())
                .with_timeout(self.cfg.provenance_timeout()),
        );
        ProvenanceVerifier::new(tree, anchor, store, self.runner.clone())
            .with_gnupg_home(gnupg_home)
            .with_timeout(self.cfg.provenance_timeout())
            .verify(&revision, &self.cancel)
    }

    /// Both subjects run concurrently; each produces one document per
    /// configured format.
    fn exec_sbom(
        &self,
        tree: &SourceTree,
        artifact_path: &std::path::Path,
        opts: &RunOptions,
    ) -> Result<(Vec<SbomDocument>, Vec<String>), StageError> {
        let artifact_formats = self
            .cfg
            .formats_for_artifact()
            .map_err(|e| StageError::ToolError(e.to_string()))?;
        let source_formats = self
            .cfg
            .formats_for_source()
            .map_err(|e| StageError::ToolError(e.to_string()))?;
        let output_dir = opts
            .output_dir
            .clone()
            .unwrap_or_else(|| self.cfg.sbom_output_dir(&self.repo_root));

        let generator = SbomGenerator::new(self.runner.clone(), self.cfg.sbom.command.clone())
            .with_timeout(self.cfg.sbom_timeout());

        let (artifact_report, source_report) = thread::scope(|s| {
            let artifact = s.spawn(|| {
                generator.generate(
                    relgate_core::SbomSubject::Artifact,
                    artifact_path,
                    &artifact_formats,
                    &output_dir,
                    &self.cancel,
                )
            });
            let source = s.spawn(|| {
                generator.generate(
                    relgate_core::SbomSubject::SourceDependencyGraph,
                    &tree.root,
                    &source_formats,
                    &output_dir,
                    &self.cancel,
                )
            });
            (
                artifact.join().unwrap_or_else(|_| Err(StageError::ToolError("sbom worker panicked".into()))),
                source.join().unwrap_or_else(|_| Err(StageError::ToolError("sbom worker panicked".into()))),
            )
        });

        let mut documents = Vec::new();
        let mut degraded = Vec::new();
        for report in [artifact_report?, source_report?] {
            documents.extend(report.documents);
            degraded.extend(report.degraded);
        }
        Ok((documents, degraded))
    }

    /// Scans artifact and source dependency graph concurrently and merges
    /// findings in target order.
    fn exec_scan(
        &self,
        tree: &SourceTree,
        artifact_path: &std::path::Path,
    ) -> Result<ScanOutcome, StageError> {
        let scanner = VulnerabilityScanner::new(
            self.runner.clone(),
            self.cfg.scan.command.clone(),
            self.cfg.scan.refresh_command.clone(),
            self.cfg.scan_cache_dir(),
            Duration::from_secs(self.cfg.scan.max_cache_age_secs),
        )
        .with_timeout(self.cfg.scan_timeout());

        let artifact_target = ScanTarget::Artifact(artifact_path.to_path_buf());
        let source_target = ScanTarget::SourceDependencyGraph(tree.root.clone());

        let (artifact_outcome, source_outcome) = thread::scope(|s| {
            let artifact = s.spawn(|| scanner.scan(&artifact_target, &self.cancel));
            let source = s.spawn(|| scanner.scan(&source_target, &self.cancel));
            (
                artifact.join().unwrap_or_else(|_| Err(StageError::ToolError("scan worker panicked".into()))),
                source.join().unwrap_or_else(|_| Err(StageError::ToolError("scan worker panicked".into()))),
            )
        });

        let mut merged = artifact_outcome?;
        let source = source_outcome?;
        merged.findings.extend(source.findings);
        merged.degraded.extend(source.degraded);
        Ok(merged)
    }
}

fn join_stage<T>(
    handle: thread::ScopedJoinHandle<'_, Result<T, StageError>>,
    stage: StageName,
) -> Result<T, StageError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(StageError::ToolError(format!("{} stage panicked", stage.as_str()))))
}
