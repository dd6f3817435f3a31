// src/script/mod.rs
//! Recipe-script adapter (§4.3): loads a recipe script in an isolated
//! interpreter, extracts its declared globals, and invokes phase verbs with
//! the argument lists §4.7 specifies.
//!
//! Grounded on `other_examples/manifests/LevitateOS-recipe`, a Rhai-based
//! package-recipe executor with the same acquire/build/install shape — the
//! closest real analogue to spec.md's recipe-script surface in the
//! retrieval pack. Every node owns its own `Engine`, so no mutable
//! interpreter state is ever shared across node threads (§4.3's isolation
//! requirement is structural, not something enforced at call time).

mod sandbox;
pub(crate) mod value;

pub use sandbox::SandboxContext;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rhai::{Dynamic, Engine, Map as RhaiMap, Scope, AST};

use crate::error::{Error, Result};
use crate::identity::IdentityQuery;
use crate::options::Options;
use crate::phase::Phase;

/// The loaded, isolated interpreter state for one node. Thread-confined:
/// only the node's own executor thread ever touches this (§3, §4.3).
pub struct ScriptState {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    pub path: PathBuf,
}

/// Classification of a phase verb global/function (§4.3, §6).
pub enum PhaseVerb {
    Command(String),
    CommandList(Vec<String>),
    Declarative(RhaiMap),
    Callable,
}

/// One entry of a recipe's `DEPENDENCIES` table, in the script's own
/// vocabulary — converted into a `DepDeclaration` (with real `RecipeSpec`s)
/// by the `recipe_fetch` handler, which alone has access to the spec pool.
#[derive(Debug, Clone, Default)]
pub struct RawDepEntry {
    pub identity: Option<String>,
    pub options: Option<RhaiMap>,
    pub source: Option<RhaiMap>,
    pub needed_by: Option<String>,
    pub weak: Option<RhaiMap>,
    pub product: Option<String>,
    pub constraint: Option<String>,
}

pub struct ScriptAdapter {
    sandbox: SandboxContext,
}

impl ScriptAdapter {
    pub fn new(sandbox: SandboxContext) -> Self {
        ScriptAdapter { sandbox }
    }

    /// Load a recipe script from disk into a fresh, isolated interpreter.
    pub fn load(&self, path: &Path) -> Result<ScriptState> {
        let text = std::fs::read_to_string(path)?;
        let mut engine = Engine::new();
        let mut scope = Scope::new();
        sandbox::install(&mut engine, &mut scope, &self.sandbox);

        let ast = engine.compile(&text).map_err(|e| Error::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| Error::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(ScriptState {
            engine,
            ast,
            scope,
            path: path.to_path_buf(),
        })
    }

    /// `extract_identity`: missing or non-string `IDENTITY` is a load error.
    pub fn extract_identity(&self, state: &ScriptState) -> Result<String> {
        state
            .scope
            .get_value::<String>("IDENTITY")
            .ok_or_else(|| Error::ParseError {
                path: state.path.clone(),
                message: "recipe script is missing a string IDENTITY global".into(),
            })
    }

    /// Non-nil `VALIDATE(options)` result fails early.
    pub fn validate(&self, state: &mut ScriptState, options: &Options) -> Result<Option<String>> {
        if !has_function(&state.ast, "VALIDATE") {
            return Ok(None);
        }
        let args = vec![value::options_to_dynamic(options)];
        let result: Dynamic = state
            .engine
            .call_fn(&mut state.scope, &state.ast, "VALIDATE", args)
            .map_err(|e| script_phase_error(state, "validate", &e))?;
        if result.is_unit() {
            Ok(None)
        } else {
            Ok(result.try_cast::<String>())
        }
    }

    /// A verb exists if its global is a string/array (declarative shorthand)
    /// or a callable function of the same (uppercased) name.
    pub fn extract_phase_verbs(&self, state: &ScriptState) -> HashSet<Phase> {
        [
            Phase::Check,
            Phase::Fetch,
            Phase::Stage,
            Phase::Build,
            Phase::Install,
            Phase::Deploy,
        ]
        .into_iter()
        .filter(|p| self.phase_verb(state, *p).is_some())
        .collect()
    }

    /// Classify the verb for `phase`, if the script declares one at all.
    pub fn phase_verb(&self, state: &ScriptState, phase: Phase) -> Option<PhaseVerb> {
        let name = phase.as_str().to_uppercase();
        if has_function(&state.ast, &name) {
            return Some(PhaseVerb::Callable);
        }
        let value = state.scope.get_value::<Dynamic>(&name)?;
        if let Some(s) = value.clone().try_cast::<String>() {
            return Some(PhaseVerb::Command(s));
        }
        if value.is_array() {
            let arr = value.into_array().ok()?;
            let items: Option<Vec<String>> =
                arr.into_iter().map(|v| v.try_cast::<String>()).collect();
            return items.map(PhaseVerb::CommandList);
        }
        if value.is_map() {
            return value.try_cast::<RhaiMap>().map(PhaseVerb::Declarative);
        }
        None
    }

    /// Call a phase's function with the phase-specific argument list.
    pub fn invoke_phase_fn(&self, state: &mut ScriptState, phase: Phase, args: Vec<Dynamic>) -> Result<()> {
        let name = phase.as_str().to_uppercase();
        state
            .engine
            .call_fn::<Dynamic>(&mut state.scope, &state.ast, &name, args)
            .map(|_| ())
            .map_err(|e| script_phase_error(state, phase.as_str(), &e))
    }

    /// Invoke the `CHECK` callable and interpret its return as
    /// satisfied/unsatisfied: an explicit `false` or non-zero integer means
    /// unsatisfied, anything else (including no return value, matching a
    /// zero-exit command) means satisfied (§4.7).
    pub fn invoke_check_fn(&self, state: &mut ScriptState, args: Vec<Dynamic>) -> Result<bool> {
        let result: Dynamic = state
            .engine
            .call_fn(&mut state.scope, &state.ast, "CHECK", args)
            .map_err(|e| script_phase_error(state, "check", &e))?;
        Ok(dynamic_is_truthy(&result))
    }

    /// Call a named custom-fetch function (§4.7's "custom fetch function"
    /// source kind) rather than a standard phase verb.
    pub fn invoke_named_fn(&self, state: &mut ScriptState, name: &str, args: Vec<Dynamic>) -> Result<()> {
        state
            .engine
            .call_fn::<Dynamic>(&mut state.scope, &state.ast, name, args)
            .map(|_| ())
            .map_err(|e| script_phase_error(state, name, &e))
    }

    /// Invoke a callable `FETCH(tmp_dir, options)` with the narrow
    /// `fetch(list_of_{source,sha256?})` / `commit_fetch(list_of_{filename,
    /// sha256?})` binding surface §4.7 specifies: `fetch_dir` is never
    /// handed to the script directly. `fetch()` downloads (and verifies,
    /// when a hash is declared) into `tmp_dir`; `commit_fetch()` re-verifies
    /// and atomically moves named files from `tmp_dir` into `fetch_dir`.
    pub fn invoke_custom_fetch(&self, state: &mut ScriptState, tmp_dir: &Path, fetch_dir: &Path, options: &Options) -> Result<()> {
        std::fs::create_dir_all(tmp_dir)?;
        std::fs::create_dir_all(fetch_dir)?;

        let download_dir = tmp_dir.to_path_buf();
        state.engine.register_fn("fetch", move |requests: rhai::Array| -> bool {
            requests.into_iter().all(|req| {
                let Some(map) = req.try_cast::<RhaiMap>() else { return false };
                let Some(url) = value::map_get_str(&map, "source") else { return false };
                let sha256 = value::map_get_str(&map, "sha256");
                let file_name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download");
                crate::handlers::util::download_and_verify(&url, sha256.as_deref(), &download_dir.join(file_name)).is_ok()
            })
        });

        let source_dir = tmp_dir.to_path_buf();
        let dest_dir = fetch_dir.to_path_buf();
        state.engine.register_fn("commit_fetch", move |files: rhai::Array| -> bool {
            files.into_iter().all(|entry| {
                let Some(map) = entry.try_cast::<RhaiMap>() else { return false };
                let Some(name) = value::map_get_str(&map, "filename") else { return false };
                let sha256 = value::map_get_str(&map, "sha256");
                let src = source_dir.join(&name);
                if let Some(expected) = &sha256 {
                    match crate::cache::verify_or_stale(&src, Some(expected.as_str())) {
                        Ok(true) => {}
                        _ => return false,
                    }
                } else if !src.exists() {
                    return false;
                }
                std::fs::rename(&src, dest_dir.join(&name)).is_ok()
            })
        });

        let args = vec![Dynamic::from(tmp_dir.to_string_lossy().into_owned()), value::options_to_dynamic(options)];
        self.invoke_phase_fn(state, Phase::Fetch, args)
    }

    pub fn extract_products(&self, state: &ScriptState) -> Result<std::collections::HashMap<String, String>> {
        let Some(map) = state.scope.get_value::<RhaiMap>("PRODUCTS") else {
            return Ok(std::collections::HashMap::new());
        };
        let mut out = std::collections::HashMap::new();
        for (k, v) in map.iter() {
            let s = v.clone().try_cast::<String>().ok_or_else(|| Error::ParseError {
                path: state.path.clone(),
                message: format!("PRODUCTS['{k}'] must be a non-empty string"),
            })?;
            if s.is_empty() {
                return Err(Error::ParseError {
                    path: state.path.clone(),
                    message: format!("PRODUCTS['{k}'] must be non-empty"),
                });
            }
            out.insert(k.to_string(), s);
        }
        Ok(out)
    }

    /// `DEPENDENCIES` may be a static table or a callable invoked with
    /// `options`; either way the result must be deterministic for a given
    /// `(identity, options)` (§4.3) — we never cache across calls since the
    /// node calls this exactly once, during its own `recipe_fetch`.
    pub fn extract_dependencies(&self, state: &mut ScriptState, options: &Options) -> Result<Vec<RawDepEntry>> {
        let array = if has_function(&state.ast, "DEPENDENCIES") {
            let args = vec![value::options_to_dynamic(options)];
            let result: Dynamic = state
                .engine
                .call_fn(&mut state.scope, &state.ast, "DEPENDENCIES", args)
                .map_err(|e| script_phase_error(state, "DEPENDENCIES", &e))?;
            if result.is_unit() {
                Vec::new()
            } else {
                result.into_array().map_err(|_| Error::ParseError {
                    path: state.path.clone(),
                    message: "DEPENDENCIES() must return an array".into(),
                })?
            }
        } else {
            match state.scope.get_value::<rhai::Array>("DEPENDENCIES") {
                Some(arr) => arr,
                None => Vec::new(),
            }
        };

        array
            .into_iter()
            .map(|entry| parse_dep_entry(&state.path, entry))
            .collect()
    }
}

fn dynamic_is_truthy(value: &Dynamic) -> bool {
    if let Some(b) = value.clone().try_cast::<bool>() {
        return b;
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return i == 0;
    }
    true
}

fn has_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|f| f.name == name)
}

fn script_phase_error(state: &ScriptState, phase: &str, err: &rhai::EvalAltResult) -> Error {
    Error::PhaseFailure {
        identity: state
            .scope
            .get_value::<String>("IDENTITY")
            .unwrap_or_else(|| state.path.display().to_string()),
        phase: Phase::parse(phase).unwrap_or(Phase::RecipeFetch),
        message: err.to_string(),
        script_location: Some(state.path.display().to_string()),
    }
}

fn parse_dep_entry(declaring: &Path, entry: Dynamic) -> Result<RawDepEntry> {
    let map = entry.try_cast::<RhaiMap>().ok_or_else(|| Error::ParseError {
        path: declaring.to_path_buf(),
        message: "each DEPENDENCIES entry must be a table".into(),
    })?;

    Ok(RawDepEntry {
        identity: value::map_get_str(&map, "identity"),
        options: value::map_get_map(&map, "options"),
        source: value::map_get_map(&map, "source"),
        needed_by: value::map_get_str(&map, "needed_by"),
        weak: value::map_get_map(&map, "weak"),
        product: value::map_get_str(&map, "product"),
        constraint: value::map_get_str(&map, "constraint"),
    })
}

/// Convert a script-declared `source = { ... }` table into the query string
/// and options map a dependent spec needs. Exposed so `handlers::recipe_fetch`
/// can build `RecipeSpec`s without depending on `rhai` directly.
pub fn dep_identity_query(entry: &RawDepEntry) -> Result<IdentityQuery> {
    let raw = entry.identity.as_deref().or(entry.product.as_deref());
    let raw = raw.ok_or_else(|| Error::ParseError {
        path: PathBuf::new(),
        message: "dependency entry has neither 'identity' nor 'product'".into(),
    })?;
    IdentityQuery::parse(raw)
}
