// src/handlers/deploy.rs
//! The `deploy` phase handler (§4.7): optional post-install side effects,
//! `(install_dir, options)`. `install_dir` here is the published asset path
//! (post-commit), not the scratch directory `install` wrote into.

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

    let published = node.asset_path.lock().expect("asset_path mutex poisoned").clone();
    let install_dir_arg = match &published {
        Some(path) => Dynamic::from(path.to_string_lossy().into_owned()),
        None => Dynamic::UNIT,
    };
    let cwd = published.clone().unwrap_or_else(|| {
        node.spec
            .declaring_file
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    });

    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("a loaded script was confirmed present above");
    let adapter = &engine.script_adapter;

    match adapter.phase_verb(state, Phase::Deploy) {
        None => Ok(()),
        Some(PhaseVerb::Command(cmd)) => util::run_command(&cmd, &cwd, &[]),
        Some(PhaseVerb::CommandList(cmds)) => util::run_command_list(&cmds, &cwd),
        Some(PhaseVerb::Declarative(_)) => Err(crate::error::Error::ParseError {
            path: node.spec.declaring_file.clone(),
            message: "DEPLOY must be a command, command list, or callable".into(),
        }),
        Some(PhaseVerb::Callable) => {
            let args = vec![install_dir_arg, options_to_dynamic(&node.spec.options)];
            adapter.invoke_phase_fn(state, Phase::Deploy, args)
        }
    }
}
