// src/cache/fetch_cache.rs
//! Per-file verification inside a `fetch/` sub-cache (§4.2): a file with a
//! declared sha256 is reused iff its on-disk hash matches; a file with no
//! declared hash is always re-downloaded.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// `true` iff `path` exists and, when `expected_sha256` is given, its
/// content hash matches. A `None` hash never short-circuits a download.
pub fn verify_or_stale(path: &Path, expected_sha256: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_sha256 else {
        return Ok(false);
    };
    if !path.exists() {
        return Ok(false);
    }
    let contents = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    let actual = hex::encode(hasher.finalize());
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Diagnostic-only marker for a fully verified fetch batch; actual reuse
/// decisions always re-check individual files via `verify_or_stale`.
pub fn mark_fetch_complete(fetch_dir: &Path) -> Result<()> {
    fs::create_dir_all(fetch_dir)?;
    fs::write(fetch_dir.join("envy-complete"), b"")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_hash_always_reports_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.tgz");
        fs::write(&path, b"data").unwrap();
        assert!(!verify_or_stale(&path, None).unwrap());
    }

    #[test]
    fn matching_hash_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.tgz");
        fs::write(&path, b"data").unwrap();
        let mut hasher = Sha256::new();
        hasher.update(b"data");
        let expected = hex::encode(hasher.finalize());
        assert!(verify_or_stale(&path, Some(&expected)).unwrap());
    }

    #[test]
    fn mismatched_hash_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.tgz");
        fs::write(&path, b"data").unwrap();
        assert!(!verify_or_stale(&path, Some("0000000000000000000000000000000000000000000000000000000000000000")).unwrap());
    }

    #[test]
    fn missing_file_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.tgz");
        assert!(!verify_or_stale(&path, Some("aa")).unwrap());
    }
}
