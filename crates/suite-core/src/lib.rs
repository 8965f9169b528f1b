//! Shared building blocks for the benchmark suite: the argument/result value
//! model, test descriptors, content digests and durable file writes.

mod descriptor;
mod values;

pub use descriptor::{BenchmarkRef, Experiment, TestDescriptor};
pub use values::{ArgValue, Args, Row, Scalar};

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Hex digest prefixed with the algorithm, e.g. `sha256:9f86d0...`.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Streams the file through SHA-256. The error is the raw I/O error so callers
/// can attach the artifact that could not be read.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Rebuilds `value` with every object's keys in sorted order, independent of
/// how the map type orders its entries.
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize_json(&obj[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = canonicalize_json(value);
    // Serializing a `Value` cannot fail: all keys are strings.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// Writes to a hidden sibling file, fsyncs it and renames it over `path`, so a
/// crash never leaves a partially written file under the final name.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "suite_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": true, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": true}, "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert_ne!(
            canonical_json_digest(&a),
            canonical_json_digest(&json!({"b": 2, "a": {"y": true, "x": [1, 2]}}))
        );
    }

    #[test]
    fn file_digest_matches_byte_digest() {
        let dir = scratch_dir("digest");
        let path = dir.join("blob.bin");
        fs::write(&path, b"hello").expect("write");
        assert_eq!(sha256_file(&path).expect("hash"), sha256_bytes(b"hello"));
        assert_eq!(
            sha256_bytes(b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_file_digest_is_not_found() {
        let err = sha256_file(Path::new("/nonexistent/suite/artifact")).expect_err("missing");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = scratch_dir("atomic");
        let path = dir.join("nested").join("entry.json");
        atomic_write_json_pretty(&path, &json!({"v": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"v": 2})).expect("second write");
        let back: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(back, json!({"v": 2}));
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(dir);
    }
}
