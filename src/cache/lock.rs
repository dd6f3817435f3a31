// src/cache/lock.rs
//! The scoped lock handed back by `CacheStore::ensure` on the slow path.
//! Its `Drop` impl is the three-way commit/rollback branch §4.2 specifies —
//! the "RAII handle whose destructor commits or aborts" design note (§9).

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::cache::{fingerprint, EntryKind};
use crate::error::Result;

enum Outcome {
    Pending,
    InstallComplete,
    UserManaged,
}

pub struct ScopedLock {
    entry_dir: PathBuf,
    lock_path: PathBuf,
    kind: EntryKind,
    file: File,
    is_user_managed: bool,
    outcome: Outcome,
}

impl ScopedLock {
    pub(super) fn new(
        entry_dir: PathBuf,
        lock_path: PathBuf,
        kind: EntryKind,
        file: File,
        is_user_managed: bool,
    ) -> Self {
        ScopedLock {
            entry_dir,
            lock_path,
            kind,
            file,
            is_user_managed,
            outcome: Outcome::Pending,
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        self.entry_dir.join("install")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.entry_dir.join("work")
    }

    pub fn fetch_dir(&self) -> PathBuf {
        self.entry_dir.join("fetch")
    }

    pub fn is_user_managed(&self) -> bool {
        self.is_user_managed
    }

    /// `install/` becomes `{asset,recipe}/` atomically once this scoped
    /// lock is dropped. Only meaningful for cache-managed entries.
    pub fn mark_install_complete(&mut self) {
        self.outcome = Outcome::InstallComplete;
    }

    /// No cache-resident form for this entry; the whole directory is
    /// purged rather than published (invariant 11).
    pub fn mark_user_managed(&mut self) {
        self.outcome = Outcome::UserManaged;
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        let result = match self.outcome {
            Outcome::InstallComplete => finalize_success(&self.entry_dir, self.kind.published_dirname()),
            Outcome::UserManaged => remove_dir_if_present(&self.entry_dir),
            Outcome::Pending => finalize_failure(&self.entry_dir),
        };
        if let Err(err) = result {
            tracing::error!(entry = %self.entry_dir.display(), %err, "cache entry finalize failed");
        }
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn finalize_success(entry_dir: &Path, published_dirname: &str) -> Result<()> {
    let install_dir = entry_dir.join("install");
    let published_dir = entry_dir.join(published_dirname);
    if published_dir.exists() {
        fs::remove_dir_all(&published_dir)?;
    }
    // Same-filesystem rename: both live under the cache root, never under
    // the OS temp directory, so this is atomic (§4.2).
    fs::rename(&install_dir, &published_dir)?;
    fingerprint::write_fingerprint(&published_dir, &entry_dir.join("envy-fingerprint.blake3"))?;

    remove_dir_if_present(&entry_dir.join("work"))?;
    remove_dir_if_present(&entry_dir.join("fetch"))?;

    fs::write(entry_dir.join("envy-complete"), b"")?;
    Ok(())
}

fn finalize_failure(entry_dir: &Path) -> Result<()> {
    let install_dir = entry_dir.join("install");
    let fetch_dir = entry_dir.join("fetch");
    if dir_is_empty(&install_dir)? && dir_is_empty(&fetch_dir)? {
        remove_dir_if_present(entry_dir)?;
    }
    // Otherwise: leave `install/` (purged on the next `ensure`) and
    // `fetch/` (reusable per-file cache) in place; `envy-complete` was
    // never written, so the entry stays invisible to the fast path.
    Ok(())
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(true);
    }
    Ok(fs::read_dir(dir)?.next().is_none())
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}
