use std::path::Path;

use relgate_core::StageError;
use sha2::{Digest, Sha256};

/// Hex sha256 of a file's bytes. Two hermetic builds from the same inputs
/// must agree on this value.
pub fn digest_file(path: &Path) -> Result<String, StageError> {
    let bytes = std::fs::read(path)
        .map_err(|e| StageError::ToolError(format!("read {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
