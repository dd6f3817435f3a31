// src/handlers/check.rs
//! The `check` phase handler (§4.7): user-managed recipes only. A satisfied
//! check short-circuits the node straight to completion; anything else
//! falls through to the normal (install/deploy-only) sequence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::Dynamic;

use crate::engine::Engine;
use crate::error::Result;
use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::script::PhaseVerb;

use super::{util, PhaseOutcome};

pub fn run(engine: &Arc<Engine>, node: &Arc<RecipeNode>) -> Result<PhaseOutcome> {
    let is_user_managed = node
        .is_user_managed
        .lock()
        .expect("is_user_managed mutex poisoned")
        .unwrap_or(false);
    if !is_user_managed {
        return Ok(PhaseOutcome::Continue);
    }

    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("a user-managed node always has a loaded script");
    let adapter = &engine.script_adapter;
    let Some(verb) = adapter.phase_verb(state, Phase::Check) else {
        return Ok(PhaseOutcome::Continue);
    };

    let cwd: PathBuf = node
        .spec
        .declaring_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let satisfied = match verb {
        PhaseVerb::Command(cmd) => util::run_command(&cmd, &cwd, &[]).is_ok(),
        PhaseVerb::CommandList(cmds) => util::run_command_list(&cmds, &cwd).is_ok(),
        PhaseVerb::Callable => {
            let args = vec![Dynamic::from(cwd.to_string_lossy().into_owned())];
            adapter.invoke_check_fn(state, args)?
        }
        PhaseVerb::Declarative(_) => false,
    };

    if satisfied {
        tracing::debug!(identity = %node.canonical_key(), "check passed, skipping to completion");
        Ok(PhaseOutcome::SkipToCompletion)
    } else {
        tracing::info!(identity = %node.canonical_key(), "check did not pass, proceeding to install");
        Ok(PhaseOutcome::Continue)
    }
}
