// src/handlers/install.rs
//! The `install` phase handler (§4.7): `(install_dir, stage_dir, fetch_dir,
//! tmp_dir, options)`. Cache-managed nodes populate `install_dir` and commit
//! the held asset lock on success, publishing it atomically; user-managed
//! nodes get `nil` for every path argument and never hold (so never commit)
//! an asset cache entry at all — "`mark_install_complete()` is forbidden for
//! user-managed nodes" falls out of that structurally rather than needing a
//! runtime check.

use std::path::Path;
use std::sync::Arc;

use rhai::Dynamic;

use crate::engine::Engine;
use crate::error::Result;
use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::script::value::options_to_dynamic;
use crate::script::PhaseVerb;

use super::util;

pub fn run(engine: &Arc<Engine>, node: &Arc<RecipeNode>) -> Result<()> {
    let has_script = node.script_state.lock().expect("script_state mutex poisoned").is_some();
    if !has_script {
        return Ok(());
    }

    let is_user_managed = node.is_user_managed.lock().expect("is_user_managed mutex poisoned").unwrap_or(false);
    if is_user_managed {
        return run_user_managed(engine, node);
    }

    if !super::ensure_asset_lock(engine, node)? {
        // Already complete from a previous run; nothing left to install.
        return Ok(());
    }
    let dirs = super::asset_dirs(node).expect("asset lock was just confirmed present");
    std::fs::create_dir_all(&dirs.install_dir)?;

    {
        let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
        let state = guard.as_mut().expect("cache-managed node has a loaded script");
        let adapter = &engine.script_adapter;
        match adapter.phase_verb(state, Phase::Install) {
            None => {}
            Some(PhaseVerb::Command(cmd)) => util::run_command(&cmd, &dirs.install_dir, &[])?,
            Some(PhaseVerb::CommandList(cmds)) => util::run_command_list(&cmds, &dirs.install_dir)?,
            Some(PhaseVerb::Declarative(_)) => {
                return Err(crate::error::Error::ParseError {
                    path: node.spec.declaring_file.clone(),
                    message: "INSTALL must be a command, command list, or callable".into(),
                });
            }
            Some(PhaseVerb::Callable) => {
                std::fs::create_dir_all(&dirs.tmp_dir)?;
                let args = vec![
                    Dynamic::from(dirs.install_dir.to_string_lossy().into_owned()),
                    Dynamic::from(dirs.stage_dir.to_string_lossy().into_owned()),
                    Dynamic::from(dirs.fetch_dir.to_string_lossy().into_owned()),
                    Dynamic::from(dirs.tmp_dir.to_string_lossy().into_owned()),
                    options_to_dynamic(&node.spec.options),
                ];
                adapter.invoke_phase_fn(state, Phase::Install, args)?;
            }
        }
    }

    // Committing and dropping the lock here (rather than at node teardown)
    // publishes the entry in time for `deploy` to read the published path.
    let committed = {
        let mut guard = node.asset_lock.lock().expect("asset_lock mutex poisoned");
        if let Some(lock) = guard.as_mut() {
            lock.mark_install_complete();
        }
        guard.take()
    };
    drop(committed);

    let published = engine.cache.published_path(crate::cache::EntryKind::Asset, &node.canonical_key());
    *node.asset_path.lock().expect("asset_path mutex poisoned") = Some(published);
    Ok(())
}

/// A user-managed node reaching `install` means `check` did not report the
/// system already satisfied; the recipe's `INSTALL` verb is responsible for
/// bringing it in line. There is no asset directory for any argument.
fn run_user_managed(engine: &Arc<Engine>, node: &Arc<RecipeNode>) -> Result<()> {
    let cwd = node.spec.declaring_file.parent().unwrap_or_else(|| Path::new("."));
    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("user-managed node has a loaded script");
    let adapter = &engine.script_adapter;

    match adapter.phase_verb(state, Phase::Install) {
        None => Ok(()),
        Some(PhaseVerb::Command(cmd)) => util::run_command(&cmd, cwd, &[]),
        Some(PhaseVerb::CommandList(cmds)) => util::run_command_list(&cmds, cwd),
        Some(PhaseVerb::Declarative(_)) => Err(crate::error::Error::ParseError {
            path: node.spec.declaring_file.clone(),
            message: "INSTALL must be a command, command list, or callable".into(),
        }),
        Some(PhaseVerb::Callable) => {
            let nil = Dynamic::UNIT;
            let args = vec![nil.clone(), nil.clone(), nil.clone(), nil, options_to_dynamic(&node.spec.options)];
            adapter.invoke_phase_fn(state, Phase::Install, args)
        }
    }
}
