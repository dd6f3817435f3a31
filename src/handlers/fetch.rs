// src/handlers/fetch.rs
//! The `fetch` phase handler (§4.7): populates this attempt's `fetch/`
//! sub-cache, either from a declarative `{source, sha256?}` descriptor, a
//! command, or a callable `FETCH(tmp_dir, options)`.

use std::sync::Arc;

use rhai::Map as RhaiMap;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::script::value::map_get_str;
use crate::script::PhaseVerb;

use super::util;

pub fn run(engine: &Arc<Engine>, node: &Arc<RecipeNode>) -> Result<()> {
    if !super::is_cache_managed(node) {
        return Ok(());
    }
    if !super::ensure_asset_lock(engine, node)? {
        return Ok(());
    }
    let dirs = super::asset_dirs(node).expect("asset lock was just confirmed present");

    let mut guard = node.script_state.lock().expect("script_state mutex poisoned");
    let state = guard.as_mut().expect("cache-managed node has a loaded script");
    let adapter = &engine.script_adapter;

    match adapter.phase_verb(state, Phase::Fetch) {
        None => {}
        Some(PhaseVerb::Command(cmd)) => util::run_command(&cmd, &dirs.fetch_dir, &[])?,
        Some(PhaseVerb::CommandList(cmds)) => util::run_command_list(&cmds, &dirs.fetch_dir)?,
        Some(PhaseVerb::Declarative(table)) => fetch_declarative(&dirs.fetch_dir, &table)?,
        Some(PhaseVerb::Callable) => {
            // §4.7: a callable FETCH never receives `fetch_dir` directly; it
            // populates it only through the `fetch`/`commit_fetch` binding.
            adapter.invoke_custom_fetch(state, &dirs.tmp_dir, &dirs.fetch_dir, &node.spec.options)?;
        }
    }

    crate::cache::mark_fetch_complete(&dirs.fetch_dir)?;
    Ok(())
}

/// A declarative `FETCH` table is either one `{source, sha256?}` request or
/// a `{files = [{source, sha256?}, ...]}` batch of them. Each file already
/// present under `fetch/` with a matching declared hash is reused in place;
/// everything else is (re-)downloaded.
fn fetch_declarative(fetch_dir: &std::path::Path, table: &RhaiMap) -> Result<()> {
    std::fs::create_dir_all(fetch_dir)?;

    let requests = if let Some(files) = table.get("files") {
        files
            .clone()
            .into_array()
            .map_err(|_| Error::ParseError {
                path: fetch_dir.to_path_buf(),
                message: "FETCH['files'] must be an array".into(),
            })?
            .into_iter()
            .map(|entry| {
                entry.try_cast::<RhaiMap>().ok_or_else(|| Error::ParseError {
                    path: fetch_dir.to_path_buf(),
                    message: "each FETCH['files'] entry must be a table".into(),
                })
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![table.clone()]
    };

    let total = requests.len();
    let mut failures = Vec::new();
    for request in requests {
        if let Err(err) = fetch_one(fetch_dir, &request) {
            failures.push(err);
        }
    }

    if !failures.is_empty() {
        let message = failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        return Err(Error::ParseError {
            path: fetch_dir.to_path_buf(),
            message: format!("{} of {total} fetch requests failed: {message}", failures.len()),
        });
    }
    Ok(())
}

fn fetch_one(fetch_dir: &std::path::Path, request: &RhaiMap) -> Result<()> {
    let url = map_get_str(request, "source").ok_or_else(|| Error::ParseError {
        path: fetch_dir.to_path_buf(),
        message: "FETCH request is missing 'source'".into(),
    })?;
    let sha256 = map_get_str(request, "sha256");

    let file_name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download");
    let dest = fetch_dir.join(file_name);

    if crate::cache::verify_or_stale(&dest, sha256.as_deref())? {
        return Ok(());
    }
    util::download_and_verify(&url, sha256.as_deref(), &dest)
}
