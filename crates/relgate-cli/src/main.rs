use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relgate_core::{
    meets_threshold, overall_exit, ExitClass, PipelineRun, StageName, StageStatus,
    VerificationResult,
};
use relgate_runner::{Config, Driver, RunOptions};
use relgate_tool::ProcessRunner;

#[derive(Parser)]
#[command(name = "relgate", version)]
struct Cli {
    /// Config file (defaults to relgate.toml in the repo root)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default relgate.toml into the current repo
    Init,

    /// Build the versioned artifact with the pinned toolchain
    Build {
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        version: String,
    },

    /// Verify commit provenance. Exit 0 = valid, 1 = invalid, 2 = unknown
    Verify {
        /// Revision to verify (defaults to the committed tip)
        #[arg(long)]
        revision: Option<String>,
    },

    /// Generate SBOM documents for the artifact and the source graph
    Sbom {
        /// Where documents land (defaults to the configured output dir)
        output_dir: Option<PathBuf>,
        /// Pre-built artifact to describe (required unless build ran)
        #[arg(long)]
        artifact: Option<PathBuf>,
    },

    /// Scan artifact and dependency graph for known vulnerabilities
    Scan {
        /// Exit non-zero when findings meet the configured threshold
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        artifact: Option<PathBuf>,
    },

    /// Run the full pipeline: build, verify, sbom, scan
    All {
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        version: String,
        /// Stages whose failure fails the run, on top of stages.required
        #[arg(long)]
        require: Vec<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        strict: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    if let Command::Init = cli.cmd {
        Driver::init_repo(&repo_root)?;
        println!("Initialized relgate in {}", repo_root.display());
        return Ok(());
    }

    let driver = open_driver(repo_root, cli.config)?;
    let code = match cli.cmd {
        Command::Init => unreachable!("handled above"),
        Command::Build { version } => {
            let opts = RunOptions { version: Some(version), ..Default::default() };
            let run = driver.run(&[StageName::Build], &opts)?;
            overall_exit(&run.reports, &[StageName::Build]).code()
        }
        Command::Verify { revision } => {
            let opts = RunOptions { revision, ..Default::default() };
            let run = driver.run(&[StageName::Verify], &opts)?;
            verify_exit_code(&run)
        }
        Command::Sbom { output_dir, artifact } => {
            let opts = RunOptions { output_dir, artifact, ..Default::default() };
            let run = driver.run(&[StageName::Sbom], &opts)?;
            for degraded in &run.degraded {
                eprintln!("degraded: {}", degraded);
            }
            overall_exit(&run.reports, &[StageName::Sbom]).code()
        }
        Command::Scan { strict, artifact } => {
            let opts = RunOptions { artifact, ..Default::default() };
            let run = driver.run(&[StageName::Scan], &opts)?;
            print_findings(&run);
            scan_exit_code(&driver, &run, strict)?
        }
        Command::All { version, require, output_dir, strict } => {
            let require = require
                .iter()
                .map(|s| StageName::parse(s).ok_or_else(|| anyhow!("unknown stage {:?}", s)))
                .collect::<Result<Vec<_>>>()?;
            let opts = RunOptions {
                version: Some(version),
                output_dir,
                require,
                ..Default::default()
            };
            let run = driver.run(
                &[StageName::Build, StageName::Verify, StageName::Sbom, StageName::Scan],
                &opts,
            )?;
            print_findings(&run);
            for degraded in &run.degraded {
                eprintln!("degraded: {}", degraded);
            }
            let required = driver.required_stages(&opts)?;
            let exit = overall_exit(&run.reports, &required);
            if exit == ExitClass::AdvisoryFailures {
                println!("advisory failures present");
            }
            if strict && scan_exit_code(&driver, &run, true)? != 0 {
                1
            } else {
                exit.code()
            }
        }
    };

    std::process::exit(code);
}

fn open_driver(repo_root: PathBuf, config: Option<PathBuf>) -> Result<Driver> {
    match config {
        Some(path) => {
            let cfg = Config::load_from(&path)?;
            Ok(Driver::new(repo_root, cfg, Arc::new(ProcessRunner::new())))
        }
        None => Driver::open(repo_root),
    }
}

fn verify_exit_code(run: &PipelineRun) -> i32 {
    match run.verification.as_ref().map(|o| &o.result) {
        Some(VerificationResult::Valid) => 0,
        Some(VerificationResult::Invalid) => 1,
        // Unknown, NotAVersionedTree, or any verifier error
        _ => 2,
    }
}

fn scan_exit_code(driver: &Driver, run: &PipelineRun, strict: bool) -> Result<i32> {
    if !strict {
        return Ok(0);
    }
    let threshold = driver.cfg.severity_threshold()?;
    let scan_failed = run
        .report_for(StageName::Scan)
        .map(|r| r.status == StageStatus::Failed)
        .unwrap_or(false);
    if scan_failed || meets_threshold(&run.findings, threshold) {
        Ok(1)
    } else {
        Ok(0)
    }
}

fn print_findings(run: &PipelineRun) {
    for f in &run.findings {
        println!(
            "finding component={} installed={} advisory={} severity={}",
            f.component,
            f.installed,
            f.advisory,
            f.severity.as_str()
        );
    }
}
