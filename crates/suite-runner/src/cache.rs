//! Content-addressable store of trial rows. A key covers both run hashes of
//! a trial and its replication index, so a rebuilt binary or a changed
//! argument never reuses an old result.

use anyhow::{Context, Result};
use serde_json::json;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use suite_core::{atomic_write_bytes, canonicalize_json, ensure_dir, sha256_bytes, Row};
use tracing::{debug, warn};

use crate::benchmark::RunHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Neither read nor written.
    Disabled,
    ReadWrite,
    /// Only previously stored rows are used; misses are skipped, not run.
    ReadOnly,
}

impl CacheMode {
    pub fn from_flags(enabled: bool, only: bool) -> Self {
        match (enabled, only) {
            (false, _) => CacheMode::Disabled,
            (true, true) => CacheMode::ReadOnly,
            (true, false) => CacheMode::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(primary: &RunHash, concurrent: Option<&RunHash>, replication: u32) -> Self {
        let material = canonicalize_json(&json!([
            primary.as_str(),
            concurrent.map(RunHash::as_str),
            replication,
        ]));
        let digest = sha256_bytes(material.to_string().as_bytes());
        let hex = digest.strip_prefix("sha256:").unwrap_or(&digest);
        CacheKey(hex.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One JSON file per key. Assumes a single writer.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    mode: CacheMode,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>, mode: CacheMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// A missing entry is a miss. So is an unreadable or corrupt one, after a
    /// warning; the trial simply runs again.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Row>> {
        if self.mode == CacheMode::Disabled {
            return Ok(None);
        }
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(entry = %path.display(), "unreadable cache entry ignored: {}", e);
                return Ok(None);
            }
        };
        match serde_json::from_slice::<Row>(&bytes) {
            Ok(row) => Ok(Some(row)),
            Err(e) => {
                warn!(entry = %path.display(), "corrupt cache entry ignored: {}", e);
                Ok(None)
            }
        }
    }

    /// Persists `row` atomically. Does nothing unless the cache is writable.
    pub fn store(&self, key: &CacheKey, row: &Row) -> Result<()> {
        if self.mode != CacheMode::ReadWrite {
            return Ok(());
        }
        ensure_dir(&self.dir)?;
        let path = self.entry_path(key);
        let bytes = serde_json::to_vec_pretty(row).context("serialize cache entry")?;
        atomic_write_bytes(&path, &bytes)
            .with_context(|| format!("write cache entry {}", path.display()))?;
        debug!(entry = %path.display(), "stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use suite_core::Scalar;

    fn temp_cache(tag: &str, mode: CacheMode) -> ResultCache {
        let dir = std::env::temp_dir().join(format!(
            "suite_cache_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ResultCache::new(dir, mode)
    }

    fn hash(args: suite_core::Args) -> RunHash {
        RunHash::builder("buckets").finish(&args)
    }

    #[test]
    fn key_depends_on_every_component() {
        let a = hash(suite_core::Args::new().with("lock", "mcs"));
        let b = hash(suite_core::Args::new().with("lock", "tas"));
        let base = CacheKey::compute(&a, None, 0);
        assert_eq!(base, CacheKey::compute(&a, None, 0));
        assert_eq!(base.as_str().len(), 64);
        assert_ne!(base, CacheKey::compute(&a, None, 1));
        assert_ne!(base, CacheKey::compute(&b, None, 0));
        assert_ne!(base, CacheKey::compute(&a, Some(&b), 0));
        assert_ne!(
            CacheKey::compute(&a, Some(&b), 0),
            CacheKey::compute(&b, Some(&a), 0)
        );
    }

    #[test]
    fn rows_round_trip_with_their_types() {
        let cache = temp_cache("roundtrip", CacheMode::ReadWrite);
        let key = CacheKey::compute(&hash(suite_core::Args::new()), None, 0);
        assert_eq!(cache.lookup(&key).expect("lookup"), None);

        let mut row = Row::new();
        row.insert("pauses", 17_i64);
        row.insert("throughput", 1234.5);
        row.insert("whole_float", 2.0);
        row.insert("lock", "mcs");
        row.insert("correct", true);
        cache.store(&key, &row).expect("store");
        assert!(cache.entry_path(&key).is_file());

        let back = cache.lookup(&key).expect("lookup").expect("hit");
        assert_eq!(back, row);
        assert_eq!(back.get("whole_float"), Some(&Scalar::Float(2.0)));
        assert_eq!(back.columns().collect::<Vec<_>>(), row.columns().collect::<Vec<_>>());
        let _ = fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn corrupt_entries_are_misses() {
        let cache = temp_cache("corrupt", CacheMode::ReadWrite);
        let key = CacheKey::compute(&hash(suite_core::Args::new()), None, 3);
        ensure_dir(cache.dir()).expect("dir");
        fs::write(cache.entry_path(&key), b"{ not json").expect("write");
        assert_eq!(cache.lookup(&key).expect("lookup"), None);
        let _ = fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn read_only_and_disabled_never_write() {
        let key = CacheKey::compute(&hash(suite_core::Args::new()), None, 0);
        let mut row = Row::new();
        row.insert("x", 1_i64);
        for mode in [CacheMode::ReadOnly, CacheMode::Disabled] {
            let cache = temp_cache("nowrite", mode);
            cache.store(&key, &row).expect("store");
            assert!(!cache.dir().exists());
            assert_eq!(cache.lookup(&key).expect("lookup"), None);
        }
        assert_eq!(CacheMode::from_flags(true, true), CacheMode::ReadOnly);
        assert_eq!(CacheMode::from_flags(false, true), CacheMode::Disabled);
    }
}
