use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use relgate_core::StageError;
use tracing::debug;

use crate::{CancelToken, ToolInvocation, ToolOutput, ToolRunner};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Subprocess-backed `ToolRunner`. Output is captured on reader threads so
/// a chatty child can never fill a pipe while we wait on it; the wait loop
/// enforces the deadline and forwards cancellation as a kill.
#[derive(Clone, Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn(inv: &ToolInvocation) -> Result<Child, StageError> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if inv.stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        if let Some(dir) = &inv.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &inv.env {
            cmd.env(k, v);
        }
        cmd.spawn()
            .map_err(|e| StageError::ToolError(format!("spawn {}: {}", inv.program, e)))
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, inv: &ToolInvocation, cancel: &CancelToken) -> Result<ToolOutput, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        debug!(program = %inv.program, args = ?inv.args, "spawning external tool");

        let started = Instant::now();
        let mut child = Self::spawn(inv)?;

        // readers must be draining before stdin is written, or a child that
        // fills its output pipe while we fill its input pipe deadlocks
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = std::thread::spawn(move || drain(stdout));
        let err_reader = std::thread::spawn(move || drain(stderr));

        if let Some(bytes) = &inv.stdin {
            use std::io::Write;
            // dropping the handle closes the pipe so the child sees EOF
            let mut stdin = child.stdin.take().ok_or_else(|| {
                StageError::ToolError(format!("{}: stdin not piped", inv.program))
            })?;
            stdin
                .write_all(bytes)
                .map_err(|e| StageError::ToolError(format!("write stdin: {}", e)))?;
        }

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| StageError::ToolError(format!("wait {}: {}", inv.program, e)))?
            {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StageError::Cancelled);
            }
            if let Some(timeout) = inv.timeout {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(StageError::Timeout(timeout.as_secs()));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();
        Ok(ToolOutput { code: status.code(), stdout, stderr })
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}
