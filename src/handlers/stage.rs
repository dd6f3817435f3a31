// src/handlers/stage.rs
//! The `stage` phase handler (§4.7): declarative `{strip = N}` archive
//! extraction, or a user `STAGE(fetch_dir, stage_dir, tmp_dir, options)`
//! callback.

use std::sync::Arc;

use rhai::Dynamic;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::script::value::{map_get_int, options_to_dynamic};
use crate::script::PhaseVerb;

use super::util;

pub fn run(engine: &Arc<Engine>, node: &Arc<RecipeNode>) -> Result<()> {
    if !super::is_cache_managed(node) {
        return Ok(());
    }
    let Some(dirs) = super::asset_dirs(node) else {
        return Ok(());
    };

    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("cache-managed node has a loaded script");
    let adapter = &engine.script_adapter;

    match adapter.phase_verb(state, Phase::Stage) {
        None => {}
        Some(PhaseVerb::Command(cmd)) => {
            std::fs::create_dir_all(&dirs.stage_dir)?;
            util::run_command(&cmd, &dirs.stage_dir, &[])?;
        }
        Some(PhaseVerb::CommandList(cmds)) => {
            std::fs::create_dir_all(&dirs.stage_dir)?;
            util::run_command_list(&cmds, &dirs.stage_dir)?;
        }
        Some(PhaseVerb::Declarative(table)) => {
            let strip = map_get_int(&table, "strip").unwrap_or(0);
            let strip = u32::try_from(strip).map_err(|_| Error::ParseError {
                path: node.spec.declaring_file.clone(),
                message: "STAGE['strip'] must be a non-negative integer".into(),
            })?;
            util::extract_archives(&dirs.fetch_dir, &dirs.stage_dir, strip)?;
        }
        Some(PhaseVerb::Callable) => {
            std::fs::create_dir_all(&dirs.stage_dir)?;
            std::fs::create_dir_all(&dirs.tmp_dir)?;
            let args = vec![
                Dynamic::from(dirs.fetch_dir.to_string_lossy().into_owned()),
                Dynamic::from(dirs.stage_dir.to_string_lossy().into_owned()),
                Dynamic::from(dirs.tmp_dir.to_string_lossy().into_owned()),
                options_to_dynamic(&node.spec.options),
            ];
            adapter.invoke_phase_fn(state, Phase::Stage, args)?;
        }
    }

    Ok(())
}
