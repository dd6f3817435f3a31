// src/handlers/mod.rs
//! Phase-handler dispatch (§4.7): one function per phase, called by the
//! node's own executor thread with the phase it is about to enter.
//!
//! Grounded on `src/transaction/mod.rs`'s per-phase dispatch table, which
//! the teacher uses to route a transaction's current step to its handler
//! function — the same shape, specialized to spec.md's eight fixed phases
//! instead of the teacher's configurable transaction steps.

mod build;
mod check;
mod deploy;
mod fetch;
mod install;
mod recipe_fetch;
mod stage;
pub(crate) mod util;

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::EntryKind;
use crate::engine::Engine;
use crate::error::Result;
use crate::node::RecipeNode;
use crate::phase::Phase;

/// What a phase handler asks the node's executor loop to do next.
pub enum PhaseOutcome {
    /// Advance `current_phase` to the phase just run and keep going per the
    /// normal loop.
    Continue,
    /// `check` passed: jump straight to `Completion` without visiting any
    /// later phase or ever touching the cache (§4.7's CHECK early-exit).
    SkipToCompletion,
}

/// Run the handler for `phase` and report what the executor loop should do
/// next. `ancestor_chain` is only meaningful for `recipe_fetch`, which is the
/// one phase that wires new dependency edges.
pub fn run_phase(engine: &Arc<Engine>, node: &Arc<RecipeNode>, phase: Phase, ancestor_chain: &[String]) -> Result<PhaseOutcome> {
    match phase {
        Phase::RecipeFetch => {
            recipe_fetch::run(engine, node, ancestor_chain)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Check => check::run(engine, node),
        Phase::Fetch => {
            fetch::run(engine, node)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Stage => {
            stage::run(engine, node)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Build => {
            build::run(engine, node)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Install => {
            install::run(engine, node)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Deploy => {
            deploy::run(engine, node)?;
            Ok(PhaseOutcome::Continue)
        }
        Phase::Completion => Ok(PhaseOutcome::Continue),
    }
}

/// `true` iff the node has a loaded script and is not user-managed — the
/// precondition for every asset-cache-touching phase (`fetch`/`stage`/
/// `build`/`install`). Weak/reference-only nodes have no script at all;
/// user-managed nodes never get an asset cache entry (§4.2, §4.7).
pub(super) fn is_cache_managed(node: &RecipeNode) -> bool {
    let has_script = node.script_state.lock().expect("script_state mutex poisoned").is_some();
    let is_user_managed = node.is_user_managed.lock().expect("is_user_managed mutex poisoned").unwrap_or(true);
    has_script && !is_user_managed
}

/// Acquire (or reuse) this attempt's asset `ScopedLock`, stashing it on the
/// node for `stage`/`build`/`install` to share. Returns `false` if the entry
/// was already complete from a prior run — nothing left to do.
pub(super) fn ensure_asset_lock(engine: &Engine, node: &RecipeNode) -> Result<bool> {
    let mut guard = node.asset_lock.lock().expect("asset_lock mutex poisoned");
    if guard.is_some() {
        return Ok(true);
    }
    let outcome = engine.cache.ensure(EntryKind::Asset, &node.canonical_key(), false)?;
    *guard = outcome.lock;
    Ok(guard.is_some())
}

/// The working directories for one asset-cache attempt, copied out of the
/// node's held `ScopedLock` so later phases don't need to keep it locked
/// across a potentially long-running build command.
pub(super) struct AssetDirs {
    pub install_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub fetch_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

pub(super) fn asset_dirs(node: &RecipeNode) -> Option<AssetDirs> {
    let guard = node.asset_lock.lock().expect("asset_lock mutex poisoned");
    guard.as_ref().map(|lock| AssetDirs {
        install_dir: lock.install_dir(),
        stage_dir: lock.work_dir().join("stage"),
        fetch_dir: lock.fetch_dir(),
        tmp_dir: lock.work_dir().join("tmp"),
    })
}
