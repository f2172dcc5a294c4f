use std::path::Path;

use relgate_core::StageError;
use serde_json::Value;

/// Fields that carry per-run generation metadata rather than content
/// identity: creation timestamps and the serial/namespace values derived
/// from them.
const VOLATILE_KEYS: &[&str] = &["created", "timestamp", "serialNumber", "documentNamespace"];

/// Content equality for two SBOM documents with generation timestamps
/// excluded, per the determinism guarantee: unchanged inputs must produce
/// documents this function considers equal.
pub fn content_equal_ignoring_timestamps(a: &Path, b: &Path) -> Result<bool, StageError> {
    Ok(normalized(a)? == normalized(b)?)
}

fn normalized(path: &Path) -> Result<Value, StageError> {
    let bytes = std::fs::read(path)
        .map_err(|e| StageError::ToolError(format!("read {}: {}", path.display(), e)))?;
    let mut value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| StageError::ToolError(format!("parse {}: {}", path.display(), e)))?;
    strip_volatile(&mut value);
    Ok(value)
}

fn strip_volatile(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in VOLATILE_KEYS {
                map.remove(*key);
            }
            for child in map.values_mut() {
                strip_volatile(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_volatile(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn equal_modulo_generation_timestamp() {
        let dir = tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.json",
            r#"{"metadata":{"timestamp":"2026-01-01T00:00:00Z"},"components":[{"name":"libx"}]}"#,
        );
        let b = write(
            dir.path(),
            "b.json",
            r#"{"metadata":{"timestamp":"2026-02-02T12:34:56Z"},"components":[{"name":"libx"}]}"#,
        );
        assert!(content_equal_ignoring_timestamps(&a, &b).unwrap());
    }

    #[test]
    fn component_differences_still_count() {
        let dir = tempdir().unwrap();
        let a = write(dir.path(), "a.json", r#"{"components":[{"name":"libx"}]}"#);
        let b = write(dir.path(), "b.json", r#"{"components":[{"name":"liby"}]}"#);
        assert!(!content_equal_ignoring_timestamps(&a, &b).unwrap());
    }

    #[test]
    fn spdx_namespace_and_cyclonedx_serial_are_volatile() {
        let dir = tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.json",
            r#"{"documentNamespace":"https://spdx.example/one","serialNumber":"urn:uuid:1","creationInfo":{"created":"2026-01-01T00:00:00Z"}}"#,
        );
        let b = write(
            dir.path(),
            "b.json",
            r#"{"documentNamespace":"https://spdx.example/two","serialNumber":"urn:uuid:2","creationInfo":{"created":"2026-03-03T00:00:00Z"}}"#,
        );
        assert!(content_equal_ignoring_timestamps(&a, &b).unwrap());
    }

    #[test]
    fn malformed_json_is_a_tool_error() {
        let dir = tempdir().unwrap();
        let a = write(dir.path(), "a.json", "{not json");
        let err = content_equal_ignoring_timestamps(&a, &a).unwrap_err();
        assert!(matches!(err, StageError::ToolError(_)));
    }
}
