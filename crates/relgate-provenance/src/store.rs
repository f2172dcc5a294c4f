use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relgate_core::StageError;
use relgate_tool::{CancelToken, ToolInvocation, ToolRunner};
use tracing::debug;

/// Local trust store holding imported public keys. Lives for the process
/// lifetime only; relgate never persists trust state of its own. Import of
/// an already-present key must be a no-op, so concurrent imports are safe.
pub trait TrustStore: Send + Sync {
    fn contains(&self, fingerprint: &str, cancel: &CancelToken) -> Result<bool, StageError>;
    fn import(&self, material: &[u8], cancel: &CancelToken) -> Result<(), StageError>;
}

/// GnuPG-backed store. An explicit home directory keeps the keyring
/// injectable (tests point it at a tempdir instead of the user keyring).
pub struct GpgTrustStore {
    runner: Arc<dyn ToolRunner>,
    home: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl GpgTrustStore {
    pub fn new(runner: Arc<dyn ToolRunner>, home: Option<PathBuf>) -> Self {
        Self { runner, home, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn gpg(&self, args: &[&str]) -> ToolInvocation {
        let mut inv = ToolInvocation::new("gpg")
            .arg("--batch")
            .args(args.iter().map(|s| s.to_string()))
            .timeout(self.timeout);
        if let Some(home) = &self.home {
            inv = inv.env("GNUPGHOME", home.display().to_string());
        }
        inv
    }
}

impl TrustStore for GpgTrustStore {
    fn contains(&self, fingerprint: &str, cancel: &CancelToken) -> Result<bool, StageError> {
        let out = self.runner.run(&self.gpg(&["--list-keys", fingerprint]), cancel)?;
        Ok(out.success())
    }

    fn import(&self, material: &[u8], cancel: &CancelToken) -> Result<(), StageError> {
        // `gpg --import` of a key already in the keyring is a no-op
        let inv = self.gpg(&["--import"]).stdin(material.to_vec());
        let out = self.runner.run(&inv, cancel)?;
        if !out.success() {
            return Err(StageError::ToolError(format!(
                "gpg --import exited with {:?}: {}",
                out.code,
                out.stderr_excerpt()
            )));
        }
        debug!("imported trust material into local store");
        Ok(())
    }
}

/// In-memory store for tests: key material is a newline-separated list of
/// fingerprints.
#[derive(Default)]
pub struct MemoryTrustStore {
    keys: Mutex<HashSet<String>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(fingerprints: &[&str]) -> Self {
        let store = Self::new();
        store
            .keys
            .lock()
            .unwrap()
            .extend(fingerprints.iter().map(|s| s.to_string()));
        store
    }
}

impl TrustStore for MemoryTrustStore {
    fn contains(&self, fingerprint: &str, _cancel: &CancelToken) -> Result<bool, StageError> {
        Ok(self.keys.lock().unwrap().contains(fingerprint))
    }

    fn import(&self, material: &[u8], _cancel: &CancelToken) -> Result<(), StageError> {
        let text = String::from_utf8_lossy(material);
        let mut keys = self.keys.lock().unwrap();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            keys.insert(line.to_string());
        }
        Ok(())
    }
}
