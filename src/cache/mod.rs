// src/cache/mod.rs
//! Content-addressed, crash-safe on-disk cache (§4.2, §6). `CacheStore`
//! owns path derivation and the lock-free fast path; `ScopedLock` owns the
//! slow path's three-way commit/rollback.
//!
//! Grounded on `src/recipe/cache.rs` (sharded cache-path derivation,
//! `CacheConfig`-style layout) and `src/db/paths.rs` (centralized path
//! helpers) — generalized from a single build-artifact cache into the two
//! entry kinds (`recipes/`, `assets/`) and the lock/publish protocol §4.2
//! adds on top.

mod fetch_cache;
mod fingerprint;
mod lock;

pub use fetch_cache::{mark_fetch_complete, verify_or_stale};
pub use fingerprint::{verify, write_fingerprint};
pub use lock::ScopedLock;

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Recipe,
    Asset,
}

impl EntryKind {
    fn dirname(self) -> &'static str {
        match self {
            EntryKind::Recipe => "recipes",
            EntryKind::Asset => "assets",
        }
    }

    fn lock_tag(self) -> &'static str {
        match self {
            EntryKind::Recipe => "recipe",
            EntryKind::Asset => "asset",
        }
    }

    /// Name `install/` is renamed to on successful completion.
    fn published_dirname(self) -> &'static str {
        match self {
            EntryKind::Recipe => "recipe",
            EntryKind::Asset => "asset",
        }
    }
}

/// Result of `ensure`: a stable path usable immediately, plus — on the slow
/// path only — the scoped lock that must be held for the duration of the
/// build/install attempt.
pub struct EnsureOutcome {
    pub path: PathBuf,
    pub lock: Option<ScopedLock>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    platform: String,
    arch: String,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, platform: impl Into<String>, arch: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("recipes"))?;
        fs::create_dir_all(root.join("assets"))?;
        fs::create_dir_all(root.join("locks"))?;
        Ok(CacheStore {
            root,
            platform: platform.into(),
            arch: arch.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{platform}-{arch}-sha256-{hash16}`: the variant segment nested under
    /// an asset entry's identity directory (§3, §6). Hashes the inputs that
    /// select a build — platform, arch, and the already-canonicalized
    /// identity+options key — not the output artifact, which doesn't exist
    /// yet when this path is first derived.
    fn variant_segment(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.platform.as_bytes());
        hasher.update(b"-");
        hasher.update(self.arch.as_bytes());
        hasher.update(b"-");
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}-sha256-{}", self.platform, self.arch, &digest[..16])
    }

    /// Recipe entries nest directly under their sanitized key (§3's recipe
    /// entry layout has no platform/arch/hash segment); asset entries nest
    /// one further level down, keyed by platform, arch, and content hash, so
    /// two platforms or architectures never collide on one asset directory.
    fn entry_dir(&self, kind: EntryKind, key: &str) -> PathBuf {
        let base = self.root.join(kind.dirname()).join(sanitize_key(key));
        match kind {
            EntryKind::Asset => base.join(self.variant_segment(key)),
            EntryKind::Recipe => base,
        }
    }

    fn lock_path(&self, kind: EntryKind, key: &str) -> PathBuf {
        let tag = match kind {
            EntryKind::Asset => format!("{}.{}", sanitize_key(key), self.variant_segment(key)),
            EntryKind::Recipe => sanitize_key(key),
        };
        self.root.join("locks").join(format!("{}.{}.lock", kind.lock_tag(), tag))
    }

    /// The path an entry's content lives at once complete — `asset/` for an
    /// asset entry, `recipe/` for a recipe entry.
    pub fn published_path(&self, kind: EntryKind, key: &str) -> PathBuf {
        self.entry_dir(kind, key).join(kind.published_dirname())
    }

    pub fn is_complete(&self, kind: EntryKind, key: &str) -> bool {
        self.entry_dir(kind, key).join("envy-complete").exists()
    }

    /// §4.2's `ensure` contract: lock-free fast path when the entry is
    /// already complete, otherwise a blocking exclusive lock with
    /// double-checked re-verification and crash-recovery cleanup.
    pub fn ensure(&self, kind: EntryKind, key: &str, is_user_managed: bool) -> Result<EnsureOutcome> {
        let entry_dir = self.entry_dir(kind, key);
        let complete_marker = entry_dir.join("envy-complete");

        if complete_marker.exists() {
            return Ok(EnsureOutcome {
                path: self.published_path(kind, key),
                lock: None,
            });
        }

        let lock_path = self.lock_path(kind, key);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock_file.lock_exclusive()?;

        if complete_marker.exists() {
            let _ = FileExt::unlock(&lock_file);
            drop(lock_file);
            let _ = fs::remove_file(&lock_path);
            return Ok(EnsureOutcome {
                path: self.published_path(kind, key),
                lock: None,
            });
        }

        fs::create_dir_all(&entry_dir)?;
        let install_dir = entry_dir.join("install");
        let work_dir = entry_dir.join("work");
        let fetch_dir = entry_dir.join("fetch");

        // Crash recovery: stale `install/`/`work/` never survive a new
        // attempt; `fetch/` is preserved so verified downloads are reused.
        if install_dir.exists() {
            fs::remove_dir_all(&install_dir)?;
        }
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir)?;
        }
        fs::create_dir_all(&install_dir)?;
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&fetch_dir)?;

        let scoped = ScopedLock::new(entry_dir, lock_path, kind, lock_file, is_user_managed);
        let install_dir = scoped.install_dir();
        Ok(EnsureOutcome {
            path: install_dir,
            lock: Some(scoped),
        })
    }
}

/// What a `gc` sweep removed: incomplete asset entries (never reached
/// `envy-complete`, e.g. from a process that died mid-build) and lock files
/// left behind by a run that exited without removing its own. Never run
/// automatically — only through the `gc` CLI path (SPEC_FULL.md §D.1).
#[derive(Debug, Default)]
pub struct GcReport {
    pub removed_asset_entries: Vec<String>,
    pub removed_locks: Vec<String>,
}

impl CacheStore {
    /// Sweep `assets/{key}/{variant}/` entries with no `envy-complete` marker
    /// and remove them (and the parent `{key}/` directory, once it has no
    /// variants left), then sweep `locks/` for lock files nothing currently
    /// holds and remove those too. Recipe entries are left alone: they are
    /// small and re-fetched losslessly, not worth the same treatment.
    pub fn gc(&self) -> Result<GcReport> {
        let mut report = GcReport::default();

        let assets_dir = self.root.join("assets");
        if assets_dir.is_dir() {
            for key_entry in fs::read_dir(&assets_dir)? {
                let key_entry = key_entry?;
                if !key_entry.file_type()?.is_dir() {
                    continue;
                }
                let key_dir = key_entry.path();
                for variant_entry in fs::read_dir(&key_dir)? {
                    let variant_entry = variant_entry?;
                    if !variant_entry.file_type()?.is_dir() {
                        continue;
                    }
                    if variant_entry.path().join("envy-complete").exists() {
                        continue;
                    }
                    fs::remove_dir_all(variant_entry.path())?;
                    report
                        .removed_asset_entries
                        .push(format!("{}/{}", key_entry.file_name().to_string_lossy(), variant_entry.file_name().to_string_lossy()));
                }
                if fs::read_dir(&key_dir)?.next().is_none() {
                    fs::remove_dir_all(&key_dir)?;
                }
            }
        }

        let locks_dir = self.root.join("locks");
        if locks_dir.is_dir() {
            for entry in fs::read_dir(&locks_dir)? {
                let entry = entry?;
                let path = entry.path();
                let Ok(file) = fs::OpenOptions::new().write(true).open(&path) else {
                    continue;
                };
                if file.try_lock_exclusive().is_ok() {
                    let _ = FileExt::unlock(&file);
                    drop(file);
                    fs::remove_file(&path)?;
                    report.removed_locks.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }

        Ok(report)
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '@' | '-' | '_') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_returns_install_dir_on_first_call() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let outcome = store.ensure(EntryKind::Asset, "local.tool@r1", false).unwrap();
        assert!(outcome.lock.is_some());
        assert!(outcome.path.ends_with("install"));
    }

    #[test]
    fn ensure_is_lock_free_once_complete() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let entry_dir = store.entry_dir(EntryKind::Asset, "local.tool@r1");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(entry_dir.join("envy-complete"), b"").unwrap();

        let outcome = store.ensure(EntryKind::Asset, "local.tool@r1", false).unwrap();
        assert!(outcome.lock.is_none());
        assert!(outcome.path.ends_with("asset"));
    }

    #[test]
    fn entry_dir_nests_a_platform_arch_hash_segment_under_the_identity() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let entry_dir = store.entry_dir(EntryKind::Asset, "local.tool@r1");
        let key_dir = entry_dir.parent().unwrap();
        assert_eq!(key_dir.file_name().unwrap(), "local.tool@r1");
        let variant = entry_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(variant.starts_with("linux-x86_64-sha256-"));

        let other_arch = CacheStore::new(dir.path(), "linux", "aarch64").unwrap();
        assert_ne!(other_arch.entry_dir(EntryKind::Asset, "local.tool@r1"), entry_dir);
    }

    #[test]
    fn recipe_entries_have_no_variant_segment() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let entry_dir = store.entry_dir(EntryKind::Recipe, "local.tool@r1");
        assert_eq!(entry_dir.file_name().unwrap(), "local.tool@r1");
    }

    #[test]
    fn is_complete_reflects_the_marker() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        assert!(!store.is_complete(EntryKind::Asset, "local.tool@r1"));

        let entry_dir = store.entry_dir(EntryKind::Asset, "local.tool@r1");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(entry_dir.join("envy-complete"), b"").unwrap();
        assert!(store.is_complete(EntryKind::Asset, "local.tool@r1"));
    }

    #[test]
    fn crash_recovery_clears_stale_install_but_keeps_fetch() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let entry_dir = store.entry_dir(EntryKind::Asset, "local.tool@r1");
        fs::create_dir_all(entry_dir.join("install")).unwrap();
        fs::write(entry_dir.join("install/partial"), b"junk").unwrap();
        fs::create_dir_all(entry_dir.join("fetch")).unwrap();
        fs::write(entry_dir.join("fetch/src.tgz"), b"verified").unwrap();

        let outcome = store.ensure(EntryKind::Asset, "local.tool@r1", false).unwrap();
        let lock = outcome.lock.unwrap();
        assert!(!lock.install_dir().join("partial").exists());
        assert!(lock.fetch_dir().join("src.tgz").exists());
    }

    #[test]
    fn gc_removes_incomplete_entries_but_keeps_complete_ones() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();

        let complete = store.entry_dir(EntryKind::Asset, "local.done@r1");
        fs::create_dir_all(&complete).unwrap();
        fs::write(complete.join("envy-complete"), b"").unwrap();

        let incomplete = store.entry_dir(EntryKind::Asset, "local.partial@r1");
        fs::create_dir_all(incomplete.join("install")).unwrap();

        let report = store.gc().unwrap();
        assert_eq!(report.removed_asset_entries.len(), 1);
        assert!(complete.exists());
        assert!(!incomplete.exists());
        assert!(!incomplete.parent().unwrap().exists(), "the now-empty key directory is cleaned up too");
    }

    #[test]
    fn gc_keeps_a_key_directory_that_still_has_a_complete_sibling_variant() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let other_arch = CacheStore::new(dir.path(), "linux", "aarch64").unwrap();

        let complete = store.entry_dir(EntryKind::Asset, "local.multi@r1");
        fs::create_dir_all(&complete).unwrap();
        fs::write(complete.join("envy-complete"), b"").unwrap();

        let incomplete = other_arch.entry_dir(EntryKind::Asset, "local.multi@r1");
        fs::create_dir_all(incomplete.join("install")).unwrap();
        assert_eq!(complete.parent().unwrap(), incomplete.parent().unwrap());

        let report = store.gc().unwrap();
        assert_eq!(report.removed_asset_entries.len(), 1);
        assert!(complete.exists());
        assert!(complete.parent().unwrap().exists(), "sibling variant is still complete");
    }

    #[test]
    fn gc_removes_unheld_lock_files() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), "linux", "x86_64").unwrap();
        let lock_path = store.lock_path(EntryKind::Asset, "local.tool@r1");
        fs::write(&lock_path, b"").unwrap();

        let report = store.gc().unwrap();
        assert_eq!(report.removed_locks.len(), 1);
        assert!(!lock_path.exists());
    }
}
