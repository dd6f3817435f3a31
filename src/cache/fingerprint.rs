// src/cache/fingerprint.rs
//! Bit-exact BLAKE3 fingerprint file format (§4.2), designed for a
//! memory-mapped scan by any implementation reading the cache directory:
//! fixed header, flat entry array, flat string table. Little-endian
//! throughout.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"ENVYFP01";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 8;
const RECORD_LEN: usize = 4 + 4 + 32 + 8 + 8;

struct Record {
    path_offset: u32,
    path_length: u32,
    hash: [u8; 32],
    size: u64,
    mtime_ns: i64,
}

/// Walk `asset_dir` and write a fingerprint of every regular file under it
/// to `out_path`. Entries are sorted by relative path so the output is
/// deterministic regardless of directory-read order.
pub fn write_fingerprint(asset_dir: &Path, out_path: &Path) -> Result<()> {
    let mut files = collect_files(asset_dir)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut string_table = Vec::new();
    let mut records = Vec::with_capacity(files.len());

    for (rel, abs) in &files {
        let bytes = rel.as_bytes();
        let path_offset = string_table.len() as u32;
        let path_length = bytes.len() as u32;
        string_table.extend_from_slice(bytes);

        let contents = fs::read(abs)?;
        let hash = *blake3::hash(&contents).as_bytes();
        let metadata = fs::metadata(abs)?;
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        records.push(Record {
            path_offset,
            path_length,
            hash,
            size: metadata.len(),
            mtime_ns,
        });
    }

    let entry_array_offset = HEADER_LEN as u64;
    let entry_array_len = (records.len() * RECORD_LEN) as u64;
    let string_table_offset = entry_array_offset + entry_array_len;

    let mut buf = Vec::with_capacity(HEADER_LEN + records.len() * RECORD_LEN + string_table.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry_array_offset.to_le_bytes());
    buf.extend_from_slice(&string_table_offset.to_le_bytes());

    for r in &records {
        buf.extend_from_slice(&r.path_offset.to_le_bytes());
        buf.extend_from_slice(&r.path_length.to_le_bytes());
        buf.extend_from_slice(&r.hash);
        buf.extend_from_slice(&r.size.to_le_bytes());
        buf.extend_from_slice(&r.mtime_ns.to_le_bytes());
    }
    buf.extend_from_slice(&string_table);

    fs::write(out_path, buf)?;
    Ok(())
}

fn collect_files(asset_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(asset_dir) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(asset_dir)
                .expect("walkdir entries are rooted at asset_dir")
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, entry.path().to_path_buf()));
        }
    }
    Ok(out)
}

/// One parsed fingerprint record, as read back by `verify`.
struct ParsedRecord {
    path: String,
    hash: [u8; 32],
    size: u64,
}

fn parse(bytes: &[u8]) -> Result<Vec<ParsedRecord>> {
    let bad = || Error::ParseError {
        path: PathBuf::new(),
        message: "malformed envy-fingerprint.blake3 file".into(),
    };
    if bytes.len() < HEADER_LEN || &bytes[0..8] != MAGIC {
        return Err(bad());
    }
    let entry_count = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let entry_array_offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap()) as usize;
    let string_table_offset = u64::from_le_bytes(bytes[24..32].try_into().unwrap()) as usize;

    let mut records = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let start = entry_array_offset + i * RECORD_LEN;
        let rec = bytes.get(start..start + RECORD_LEN).ok_or_else(bad)?;
        let path_offset = u32::from_le_bytes(rec[0..4].try_into().unwrap()) as usize;
        let path_length = u32::from_le_bytes(rec[4..8].try_into().unwrap()) as usize;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&rec[8..40]);
        let size = u64::from_le_bytes(rec[40..48].try_into().unwrap());

        let path_start = string_table_offset + path_offset;
        let path_bytes = bytes.get(path_start..path_start + path_length).ok_or_else(bad)?;
        let path = String::from_utf8(path_bytes.to_vec()).map_err(|_| bad())?;

        records.push(ParsedRecord { path, hash, size });
    }
    Ok(records)
}

/// Re-verify every file a fingerprint claims against what's actually on
/// disk under `asset_dir`. Used by the `gc`/`status` ambient tooling, never
/// by the hot install path (§4.2 treats `envy-complete` as sufficient proof
/// once written).
pub fn verify(asset_dir: &Path, fingerprint_path: &Path) -> Result<bool> {
    let bytes = fs::read(fingerprint_path)?;
    let records = parse(&bytes)?;
    for record in &records {
        let path = asset_dir.join(&record.path);
        let Ok(contents) = fs::read(&path) else {
            return Ok(false);
        };
        if contents.len() as u64 != record.size {
            return Ok(false);
        }
        if blake3::hash(&contents).as_bytes() != &record.hash {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_a_small_tree() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let fp_path = dir.path().join("envy-fingerprint.blake3");
        write_fingerprint(dir.path(), &fp_path).unwrap();

        let bytes = fs::read(&fp_path).unwrap();
        assert_eq!(&bytes[0..8], MAGIC);
        assert!(verify(dir.path(), &fp_path).unwrap());
    }

    #[test]
    fn detects_tampering() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let fp_path = dir.path().join("envy-fingerprint.blake3");
        write_fingerprint(dir.path(), &fp_path).unwrap();

        fs::write(dir.path().join("a.txt"), b"tampered").unwrap();
        assert!(!verify(dir.path(), &fp_path).unwrap());
    }

    #[test]
    fn empty_tree_produces_valid_header() {
        let dir = TempDir::new().unwrap();
        let fp_path = dir.path().join("envy-fingerprint.blake3");
        write_fingerprint(dir.path(), &fp_path).unwrap();
        let bytes = fs::read(&fp_path).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert!(verify(dir.path(), &fp_path).unwrap());
    }
}
