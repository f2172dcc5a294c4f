use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::RevisionId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StageName {
    Build,
    Verify,
    Sbom,
    Scan,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Build => "build",
            StageName::Verify => "verify",
            StageName::Sbom => "sbom",
            StageName::Scan => "scan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" => Some(StageName::Build),
            "verify" => Some(StageName::Verify),
            "sbom" => Some(StageName::Sbom),
            "scan" => Some(StageName::Scan),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// A source checkout plus the revision the run operates on.
/// Verification always targets a committed revision, never the working tree.
#[derive(Clone, Debug)]
pub struct SourceTree {
    pub root: PathBuf,
}

impl SourceTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// The compiled, versioned executable. `digest` is the hex sha256 of the
/// artifact bytes; rebuilding from the same inputs must reproduce it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub version: String,
    pub digest: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerificationResult {
    Valid,
    Invalid,
    Unknown(String),
}

impl VerificationResult {
    pub fn summary(&self) -> String {
        match self {
            VerificationResult::Valid => "valid".to_string(),
            VerificationResult::Invalid => "invalid".to_string(),
            VerificationResult::Unknown(reason) => format!("unknown: {}", reason),
        }
    }
}

/// Terminal verification outcome bound to the exact revision checked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub revision: RevisionId,
    pub result: VerificationResult,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SbomSubject {
    Artifact,
    SourceDependencyGraph,
}

impl SbomSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            SbomSubject::Artifact => "artifact",
            SbomSubject::SourceDependencyGraph => "source",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SbomFormat {
    SpdxJson,
    CycloneDxJson,
}

impl SbomFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SbomFormat::SpdxJson => "spdx",
            SbomFormat::CycloneDxJson => "cyclonedx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spdx" => Some(SbomFormat::SpdxJson),
            "cyclonedx" => Some(SbomFormat::CycloneDxJson),
            _ => None,
        }
    }
}

/// Deterministic output name for a (subject, format) pair. Repeated runs
/// overwrite the same path rather than accumulate documents.
pub fn document_filename(subject: SbomSubject, format: SbomFormat) -> String {
    format!("{}-sbom.{}.json", subject.as_str(), format.as_str())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SbomDocument {
    pub subject: SbomSubject,
    pub format: SbomFormat,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub component: String,
    pub installed: String,
    pub advisory: String,
    pub severity: Severity,
}
