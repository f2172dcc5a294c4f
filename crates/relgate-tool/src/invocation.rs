use std::path::PathBuf;
use std::time::Duration;

use relgate_core::StageError;

use crate::CancelToken;

/// One request to an external collaborator: compiler, signature checker,
/// SBOM engine, vulnerability database client, trust-material fetcher.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            env: vec![],
            stdin: None,
            timeout: None,
        }
    }

    /// Build from an argv-style command, the shape commands take in config.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ToolOutput {
    /// None when the child was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: vec![] }
    }

    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self { code: Some(code), stdout: vec![], stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Last few stderr lines, for error messages that stay one screen tall.
    pub fn stderr_excerpt(&self) -> String {
        let text = self.stderr_text();
        let lines: Vec<&str> = text.lines().collect();
        let tail = lines.len().saturating_sub(5);
        lines[tail..].join("\n")
    }
}

/// The uniform external-tool seam. Tests substitute in-process doubles;
/// production uses `ProcessRunner`.
pub trait ToolRunner: Send + Sync {
    fn run(&self, inv: &ToolInvocation, cancel: &CancelToken) -> Result<ToolOutput, StageError>;
}

/// Run and require exit 0, returning trimmed stdout. Non-zero exits map to
/// `ToolError` with a stderr excerpt.
pub fn run_ok(
    runner: &dyn ToolRunner,
    inv: &ToolInvocation,
    cancel: &CancelToken,
) -> Result<String, StageError> {
    let out = runner.run(inv, cancel)?;
    if !out.success() {
        return Err(StageError::ToolError(format!(
            "{} exited with {:?}: {}",
            inv.program,
            out.code,
            out.stderr_excerpt()
        )));
    }
    Ok(out.stdout_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_argv_splits_program_and_args() {
        let argv = vec!["git".to_string(), "rev-parse".to_string(), "HEAD".to_string()];
        let inv = ToolInvocation::from_argv(&argv).unwrap();
        assert_eq!(inv.program, "git");
        assert_eq!(inv.args, vec!["rev-parse", "HEAD"]);
        assert!(ToolInvocation::from_argv(&[]).is_none());
    }

    #[test]
    fn stderr_excerpt_keeps_the_tail() {
        let stderr = (0..10).map(|i| format!("line{}", i)).collect::<Vec<_>>().join("\n");
        let out = ToolOutput::failed(1, stderr);
        let excerpt = out.stderr_excerpt();
        assert!(excerpt.starts_with("line5"));
        assert!(excerpt.ends_with("line9"));
    }
}
