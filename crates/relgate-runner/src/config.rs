use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use relgate_core::{SbomFormat, Severity, StageName};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub provenance: ProvenanceConfig,
    pub sbom: SbomConfig,
    pub scan: ScanConfig,
    pub stages: StagesConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Compiler argv; `{version}`, `{toolchain}` and `{output}` are
    /// substituted before spawning.
    pub command: Vec<String>,
    pub lockfile: String,
    /// Exact toolchain version, never "latest".
    pub toolchain: String,
    pub out_dir: String,
    pub artifact_name: String,
    pub version_arg: String,
    #[serde(default)]
    pub lock_error_marker: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignerConfig {
    pub fingerprint: String,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub key_url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProvenanceConfig {
    #[serde(default)]
    pub signers: Vec<SignerConfig>,
    #[serde(default)]
    pub gnupg_home: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SbomConfig {
    /// SBOM engine argv; `{input}`, `{format}` and `{output}` are
    /// substituted per document.
    pub command: Vec<String>,
    /// The format set is configuration per subject. The default keeps the
    /// reference asymmetry: both formats for the artifact, SPDX only for
    /// the source dependency graph.
    pub artifact_formats: Vec<String>,
    pub source_formats: Vec<String>,
    pub output_dir: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Database client argv; `{input}` is substituted per target. Findings
    /// are expected as a JSON array on stdout.
    pub command: Vec<String>,
    #[serde(default)]
    pub refresh_command: Option<Vec<String>>,
    pub cache_dir: String,
    pub max_cache_age_secs: u64,
    pub severity_threshold: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Stages whose failure fails the whole run; everything else is
    /// advisory.
    pub required: Vec<String>,
}

impl Config {
    pub fn default_for_repo(project_id: &str) -> Self {
        Self {
            project: ProjectConfig { id: project_id.to_string() },
            build: BuildConfig {
                command: vec![
                    "make".into(),
                    "artifact".into(),
                    "VERSION={version}".into(),
                    "TOOLCHAIN={toolchain}".into(),
                    "OUTPUT={output}".into(),
                ],
                lockfile: "Cargo.lock".into(),
                toolchain: "1.74.0".into(),
                out_dir: "target/relgate".into(),
                artifact_name: project_id.to_string(),
                version_arg: "--version".into(),
                lock_error_marker: Some("lock file".into()),
                timeout_secs: None,
            },
            provenance: ProvenanceConfig::default(),
            sbom: SbomConfig {
                command: vec![
                    "syft".into(),
                    "{input}".into(),
                    "-o".into(),
                    "{format}-json={output}".into(),
                ],
                artifact_formats: vec!["spdx".into(), "cyclonedx".into()],
                source_formats: vec!["spdx".into()],
                output_dir: ".".into(),
                timeout_secs: None,
            },
            scan: ScanConfig {
                command: vec!["grype".into(), "{input}".into(), "-o".into(), "json".into()],
                refresh_command: Some(vec!["grype".into(), "db".into(), "update".into()]),
                cache_dir: "~/.cache/relgate/vulndb".into(),
                max_cache_age_secs: 24 * 60 * 60,
                severity_threshold: "high".into(),
                timeout_secs: None,
            },
            stages: StagesConfig { required: vec!["build".into()] },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse relgate.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join("relgate.toml")
    }

    pub fn required_stages(&self) -> Result<Vec<StageName>> {
        self.stages
            .required
            .iter()
            .map(|s| StageName::parse(s).ok_or_else(|| anyhow!("unknown stage {:?} in stages.required", s)))
            .collect()
    }

    pub fn severity_threshold(&self) -> Result<Severity> {
        Severity::parse(&self.scan.severity_threshold)
            .ok_or_else(|| anyhow!("unknown severity {:?} in scan.severity_threshold", self.scan.severity_threshold))
    }

    pub fn formats_for_artifact(&self) -> Result<Vec<SbomFormat>> {
        parse_formats(&self.sbom.artifact_formats)
    }

    pub fn formats_for_source(&self) -> Result<Vec<SbomFormat>> {
        parse_formats(&self.sbom.source_formats)
    }

    pub fn out_dir(&self, repo_root: &Path) -> PathBuf {
        expand(repo_root, &self.build.out_dir)
    }

    pub fn sbom_output_dir(&self, repo_root: &Path) -> PathBuf {
        expand(repo_root, &self.sbom.output_dir)
    }

    pub fn scan_cache_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.scan.cache_dir).to_string())
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build.timeout_secs.map(Duration::from_secs)
    }

    pub fn provenance_timeout(&self) -> Option<Duration> {
        self.provenance.timeout_secs.map(Duration::from_secs)
    }

    pub fn sbom_timeout(&self) -> Option<Duration> {
        self.sbom.timeout_secs.map(Duration::from_secs)
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan.timeout_secs.map(Duration::from_secs)
    }
}

fn parse_formats(names: &[String]) -> Result<Vec<SbomFormat>> {
    names
        .iter()
        .map(|s| SbomFormat::parse(s).ok_or_else(|| anyhow!("unknown sbom format {:?}", s)))
        .collect()
}

fn expand(repo_root: &Path, raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw).to_string();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    }
}
