use std::sync::Mutex;

use relgate_core::StageError;

use crate::{CancelToken, ToolInvocation, ToolOutput, ToolRunner};

/// Closure-backed `ToolRunner` double. Lets a test script exit codes,
/// malformed output, timeouts, or side effects (an SBOM engine double can
/// write the output file the invocation names) without real binaries.
/// Every invocation is recorded for assertions.
pub struct FnRunner<F> {
    respond: F,
    pub calls: Mutex<Vec<ToolInvocation>>,
}

impl<F> FnRunner<F>
where
    F: Fn(&ToolInvocation) -> Result<ToolOutput, StageError> + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self { respond, calls: Mutex::new(vec![]) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, program: &str) -> Vec<ToolInvocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.program == program)
            .cloned()
            .collect()
    }
}

impl<F> ToolRunner for FnRunner<F>
where
    F: Fn(&ToolInvocation) -> Result<ToolOutput, StageError> + Send + Sync,
{
    fn run(&self, inv: &ToolInvocation, cancel: &CancelToken) -> Result<ToolOutput, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        self.calls.lock().unwrap().push(inv.clone());
        (self.respond)(inv)
    }
}
