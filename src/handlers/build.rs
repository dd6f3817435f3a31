// src/handlers/build.rs
//! The `build` phase handler (§4.7): a command (run in `stage_dir`) or a
//! `BUILD(stage_dir, fetch_dir, tmp_dir, options)` callback. `install_dir` is
//! deliberately never passed here.

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
    if !super::is_cache_managed(node) {
        return Ok(());
    }
    let Some(dirs) = super::asset_dirs(node) else {
        return Ok(());
    };

    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("cache-managed node has a loaded script");
    let adapter = &engine.script_adapter;

    std::fs::create_dir_all(&dirs.stage_dir)?;
    match adapter.phase_verb(state, Phase::Build) {
        None => {}
        Some(PhaseVerb::Command(cmd)) => util::run_command(&cmd, &dirs.stage_dir, &[])?,
        Some(PhaseVerb::CommandList(cmds)) => util::run_command_list(&cmds, &dirs.stage_dir)?,
        Some(PhaseVerb::Declarative(_)) => {
            return Err(crate::error::Error::ParseError {
                path: node.spec.declaring_file.clone(),
                message: "BUILD must be a command, command list, or callable".into(),
            });
        }
        Some(PhaseVerb::Callable) => {
            std::fs::create_dir_all(&dirs.tmp_dir)?;
            let args = vec![
                Dynamic::from(dirs.stage_dir.to_string_lossy().into_owned()),
                Dynamic::from(dirs.fetch_dir.to_string_lossy().into_owned()),
                Dynamic::from(dirs.tmp_dir.to_string_lossy().into_owned()),
                options_to_dynamic(&node.spec.options),
            ];
            adapter.invoke_phase_fn(state, Phase::Build, args)?;
        }
    }

    Ok(())
}
