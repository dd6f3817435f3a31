// src/handlers/recipe_fetch.rs
//! The `recipe_fetch` phase handler (§4.7): acquires the recipe script,
//! validates its declared identity, extracts everything else a node needs
//! (products, phase verbs, dependencies) and wires the dependency edges
//! §4.5 specifies.
//!
//! Grounded on `src/recipe/kitchen.rs` for the "acquire then load" shape and
//! `src/resolver/engine.rs` for dependency-wiring — the part of the teacher
//! that actually converts declared requirements into graph edges.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::Map as RhaiMap;

use crate::cache::EntryKind;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityQuery};
use crate::node::{RecipeNode, WeakReference};
use crate::options::Options;
use crate::phase::Phase;
use crate::script::value::{dynamic_to_option_value, map_get_map, map_get_str};
use crate::script::RawDepEntry;
use crate::spec_pool::{DepDeclaration, RecipeSpec, SourceDescriptor};

use super::util;

pub fn run(engine: &Arc<Engine>, node: &Arc<RecipeNode>, ancestor_chain: &[String]) -> Result<()> {
    let script_path = match &node.spec.source {
        SourceDescriptor::WeakOrReference => return Ok(()),
        SourceDescriptor::Local { path } => path.clone(),
        SourceDescriptor::Remote { url, sha256 } => {
            fetch_recipe_entry(engine, node, |dest| util::download_and_verify(url, sha256.as_deref(), dest))?
        }
        SourceDescriptor::Git { url, git_ref } => {
            fetch_recipe_entry(engine, node, |dest| {
                util::shallow_clone(url, git_ref, dest.parent().expect("recipe.lua has a parent dir"))
            })?
        }
        SourceDescriptor::CustomFetch { command, .. } => fetch_recipe_entry(engine, node, |dest| {
            let tmp_dir = dest.parent().expect("recipe.lua has a parent dir");
            util::run_command(command, tmp_dir, &[("ENVY_TMP_DIR", &tmp_dir.to_string_lossy())])?;
            let produced = tmp_dir.join("recipe.lua");
            if produced != dest {
                std::fs::rename(&produced, dest)?;
            }
            Ok(())
        })?,
        SourceDescriptor::Bundle { bundle_path } => resolve_bundle_script(engine, node, bundle_path)?,
    };

    load_and_wire(engine, node, &script_path, ancestor_chain)
}

/// `ensure` a recipe cache entry and, on the slow path, run `populate` to
/// write `recipe.lua` into its install dir. Returns the path the script
/// should be loaded from once the entry is published.
fn fetch_recipe_entry(engine: &Engine, node: &RecipeNode, populate: impl FnOnce(&Path) -> Result<()>) -> Result<PathBuf> {
    let key = node.canonical_key();
    let outcome = engine.cache.ensure(EntryKind::Recipe, &key, false)?;
    if let Some(mut lock) = outcome.lock {
        let dest = lock.install_dir().join("recipe.lua");
        populate(&dest)?;
        lock.mark_install_complete();
        drop(lock);
    }
    Ok(engine.cache.published_path(EntryKind::Recipe, &key).join("recipe.lua"))
}

/// Open `bundle_path`, validate it actually contains this node's identity,
/// and return the resolved path of the contained script (§4.7: "open the
/// bundle, validate its manifest... resolve this node's script path inside
/// it"). Re-registers the bundle on every call rather than checking the
/// registry first — parsing `envy-bundle.lua` is cheap and idempotent, and
/// this keeps the registry from ever holding a stale entry if the same
/// bundle is opened from two different dependents with different relative
/// paths pointing at the same file.
fn resolve_bundle_script(engine: &Arc<Engine>, node: &RecipeNode, bundle_path: &Path) -> Result<PathBuf> {
    let meta = crate::manifest::load_bundle(bundle_path)?;
    let expected = node.spec.identity.to_string();
    let script_path = meta.specs.get(&expected).cloned().ok_or_else(|| Error::ParseError {
        path: bundle_path.to_path_buf(),
        message: format!("bundle '{}' does not declare a spec for '{expected}'", meta.identity),
    })?;
    if !script_path.is_file() {
        return Err(Error::ParseError {
            path: script_path.clone(),
            message: format!("bundle '{}' names a spec file that does not exist", meta.identity),
        });
    }
    engine.registry.register_bundle(meta);
    Ok(script_path)
}

fn load_and_wire(engine: &Arc<Engine>, node: &Arc<RecipeNode>, script_path: &Path, ancestor_chain: &[String]) -> Result<()> {
    let adapter = &engine.script_adapter;
    let mut state = adapter.load(script_path)?;

    let declared = adapter.extract_identity(&state)?;
    let expected = node.spec.identity.to_string();
    if declared != expected {
        return Err(Error::IdentityMismatch {
            expected,
            declared,
            path: script_path.to_path_buf(),
        });
    }

    if let Some(message) = adapter.validate(&mut state, &node.spec.options)? {
        return Err(Error::ParseError {
            path: script_path.to_path_buf(),
            message,
        });
    }

    let phase_verbs = adapter.extract_phase_verbs(&state);
    let is_user_managed = phase_verbs.contains(&Phase::Check);
    if is_user_managed {
        for forbidden in [Phase::Fetch, Phase::Stage, Phase::Build] {
            if phase_verbs.contains(&forbidden) {
                return Err(Error::UserManagedViolation {
                    identity: expected,
                    reason: format!("user-managed recipe must not declare {forbidden}"),
                });
            }
        }
    }

    let raw_products = adapter.extract_products(&state)?;
    let asset_dir = engine.cache.published_path(EntryKind::Asset, &node.canonical_key());
    for (name, value) in raw_products {
        let resolved = if is_user_managed {
            value
        } else {
            asset_dir.join(&value).to_string_lossy().into_owned()
        };
        node.add_product(name, resolved);
    }

    *node.is_user_managed.lock().expect("is_user_managed mutex poisoned") = Some(is_user_managed);
    *node.phase_verbs.lock().expect("phase_verbs mutex poisoned") = phase_verbs;

    let raw_deps = adapter.extract_dependencies(&mut state, &node.spec.options)?;
    let declarations: Vec<DepDeclaration> = raw_deps
        .iter()
        .map(|entry| build_declaration(&engine.spec_pool, node, script_path, entry))
        .collect::<Result<_>>()?;

    wire_dependencies(engine, node, &declarations, ancestor_chain)?;

    *node.script_state.lock().expect("script_state mutex poisoned") = Some(state);
    Ok(())
}

/// §4.5: strong deps and source-prerequisites get nodes and are started
/// toward completion immediately; weak/reference-only and product deps are
/// only recorded, left for the resolver loop to match or fall back.
fn wire_dependencies(
    engine: &Arc<Engine>,
    node: &Arc<RecipeNode>,
    declarations: &[DepDeclaration],
    ancestor_chain: &[String],
) -> Result<()> {
    let mut chain = ancestor_chain.to_vec();
    chain.push(node.canonical_key());

    for decl in declarations {
        match decl {
            DepDeclaration::Strong(spec) => {
                attach_strong(engine, node, Arc::clone(spec), &chain)?;
            }
            DepDeclaration::Weak {
                query,
                fallback,
                needed_by,
                product,
            } => {
                node.weak_references.lock().expect("weak_references mutex poisoned").push(WeakReference {
                    query: query.clone(),
                    fallback: fallback.clone(),
                    needed_by: *needed_by,
                    resolved: false,
                    product: product.clone(),
                    constraint: None,
                });
            }
            DepDeclaration::Product {
                name,
                fallback,
                needed_by,
                constraint,
            } => {
                node.weak_references.lock().expect("weak_references mutex poisoned").push(WeakReference {
                    query: IdentityQuery::default(),
                    fallback: fallback.clone(),
                    needed_by: *needed_by,
                    resolved: false,
                    product: Some(name.clone()),
                    constraint: constraint.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Attach one strong dependency edge, after first wiring the dependency's
/// own source-prerequisites (custom-fetch nested dependencies) so they are
/// already present in the child's dependency map before its executor
/// thread ever runs (§4.5, §9).
fn attach_strong(engine: &Arc<Engine>, node: &Arc<RecipeNode>, spec: Arc<RecipeSpec>, chain: &[String]) -> Result<()> {
    let needed_by = spec.needed_by.unwrap_or(Phase::DEFAULT_NEEDED_BY);
    let (child, created) = engine.registry.ensure_node(Arc::clone(&spec));

    if created {
        if let SourceDescriptor::CustomFetch { source_dependencies, .. } = &spec.source {
            for src_spec in source_dependencies {
                let (src_node, src_created) = engine.registry.ensure_node(Arc::clone(src_spec));
                if let Some(cycle) = engine.registry.would_create_cycle(&child, &src_node, Phase::RecipeFetch) {
                    return Err(Error::Cycle { path: cycle });
                }
                child.record_dependency(src_node.canonical_key(), Arc::clone(&src_node), Phase::RecipeFetch);
                if src_created {
                    crate::scheduler::start_to(engine, &src_node, Phase::Completion, chain);
                }
            }
        }
    }

    if let Some(cycle) = engine.registry.would_create_cycle(node, &child, needed_by) {
        return Err(Error::Cycle { path: cycle });
    }
    node.record_dependency(child.canonical_key(), Arc::clone(&child), needed_by);
    crate::scheduler::start_to(engine, &child, Phase::Completion, chain);
    Ok(())
}

/// Convert one script-vocabulary `DEPENDENCIES` entry into a typed
/// declaration, creating any strong dep's spec in the pool along the way.
fn build_declaration(pool: &crate::spec_pool::SpecPool, node: &RecipeNode, declaring: &Path, entry: &RawDepEntry) -> Result<DepDeclaration> {
    let needed_by = match &entry.needed_by {
        Some(name) => Phase::parse(name).ok_or_else(|| Error::NeededByInvalid {
            phase: name.clone(),
            identity: node.canonical_key(),
        })?,
        None => Phase::DEFAULT_NEEDED_BY,
    };

    if let Some(product_name) = &entry.product {
        let fallback = entry
            .weak
            .as_ref()
            .map(|table| build_fallback_spec(pool, declaring, table))
            .transpose()?;
        let constraint = entry.constraint.as_deref().map(IdentityQuery::parse).transpose()?;
        return Ok(DepDeclaration::Product {
            name: product_name.clone(),
            fallback,
            needed_by,
            constraint,
        });
    }

    let identity_str = entry.identity.as_deref().ok_or_else(|| Error::ParseError {
        path: declaring.to_path_buf(),
        message: "dependency entry has neither 'identity' nor 'product'".into(),
    })?;

    if let Some(weak_table) = &entry.weak {
        let query = IdentityQuery::parse(identity_str)?;
        let fallback = Some(build_fallback_spec(pool, declaring, weak_table)?);
        return Ok(DepDeclaration::Weak {
            query,
            fallback,
            needed_by,
            product: None,
        });
    }

    let source_table = entry.source.as_ref().ok_or_else(|| Error::ParseError {
        path: declaring.to_path_buf(),
        message: format!("strong dependency '{identity_str}' is missing a source table"),
    })?;
    let spec = build_spec_from_source(pool, declaring, identity_str, source_table, entry.options.as_ref(), Some(needed_by))?;
    Ok(DepDeclaration::Strong(spec))
}

/// The `weak = { identity = "...", source = { ... }, options = { ... } }`
/// table names the fallback's own concrete identity — independent of the
/// query identity, since a fallback need not share the query's name.
fn build_fallback_spec(pool: &crate::spec_pool::SpecPool, declaring: &Path, weak_table: &RhaiMap) -> Result<Arc<RecipeSpec>> {
    let identity_str = map_get_str(weak_table, "identity").ok_or_else(|| Error::ParseError {
        path: declaring.to_path_buf(),
        message: "weak fallback table is missing 'identity'".into(),
    })?;
    let source_table = map_get_map(weak_table, "source").ok_or_else(|| Error::ParseError {
        path: declaring.to_path_buf(),
        message: "weak fallback table is missing 'source'".into(),
    })?;
    let options_table = map_get_map(weak_table, "options");
    build_spec_from_source(pool, declaring, &identity_str, &source_table, options_table.as_ref(), None)
}

fn build_spec_from_source(
    pool: &crate::spec_pool::SpecPool,
    declaring: &Path,
    identity_str: &str,
    source_table: &RhaiMap,
    options_table: Option<&RhaiMap>,
    needed_by: Option<Phase>,
) -> Result<Arc<RecipeSpec>> {
    let identity = Identity::parse(identity_str)?;
    let options = match options_table {
        Some(table) => rhai_map_to_options(declaring, table)?,
        None => Options::new(),
    };
    let source = parse_source_table(pool, declaring, source_table)?;

    Ok(pool.insert(identity, options, source, declaring.to_path_buf(), needed_by, None, Vec::new()))
}

fn parse_source_table(pool: &crate::spec_pool::SpecPool, declaring: &Path, table: &RhaiMap) -> Result<SourceDescriptor> {
    if let Some(url) = map_get_str(table, "remote") {
        let sha256 = map_get_str(table, "sha256");
        return Ok(SourceDescriptor::Remote { url, sha256 });
    }
    if let Some(path) = map_get_str(table, "local") {
        let resolved = declaring.parent().map(|dir| dir.join(&path)).unwrap_or_else(|| path.clone().into());
        return Ok(SourceDescriptor::Local { path: resolved });
    }
    if let Some(url) = map_get_str(table, "git") {
        let git_ref = map_get_str(table, "git_ref").unwrap_or_else(|| "HEAD".to_string());
        return Ok(SourceDescriptor::Git { url, git_ref });
    }
    if let Some(bundle) = map_get_str(table, "bundle") {
        let resolved = declaring.parent().map(|dir| dir.join(&bundle)).unwrap_or_else(|| bundle.clone().into());
        return Ok(SourceDescriptor::Bundle { bundle_path: resolved });
    }
    if let Some(command) = map_get_str(table, "custom_fetch") {
        let nested = table
            .get("source_dependencies")
            .cloned()
            .map(|v| v.into_array())
            .transpose()
            .map_err(|_| Error::ParseError {
                path: declaring.to_path_buf(),
                message: "'source_dependencies' must be an array".into(),
            })?
            .unwrap_or_default();

        let mut source_dependencies = Vec::with_capacity(nested.len());
        for entry in nested {
            let entry_map = entry.try_cast::<RhaiMap>().ok_or_else(|| Error::ParseError {
                path: declaring.to_path_buf(),
                message: "each 'source_dependencies' entry must be a table".into(),
            })?;
            let identity_str = map_get_str(&entry_map, "identity").ok_or_else(|| Error::ParseError {
                path: declaring.to_path_buf(),
                message: "source_dependencies entry is missing 'identity'".into(),
            })?;
            let nested_source = map_get_map(&entry_map, "source").ok_or_else(|| Error::ParseError {
                path: declaring.to_path_buf(),
                message: "source_dependencies entry is missing 'source'".into(),
            })?;
            let nested_options = map_get_map(&entry_map, "options");
            source_dependencies.push(build_spec_from_source(pool, declaring, &identity_str, &nested_source, nested_options.as_ref(), Some(Phase::RecipeFetch))?);
        }

        return Ok(SourceDescriptor::CustomFetch { command, source_dependencies });
    }
    Err(Error::ParseError {
        path: declaring.to_path_buf(),
        message: "source table must contain one of 'remote', 'local', 'git', 'bundle', or 'custom_fetch'".into(),
    })
}

fn rhai_map_to_options(declaring: &Path, table: &RhaiMap) -> Result<Options> {
    let mut options = Options::new();
    for (key, value) in table.iter() {
        options.insert(key.to_string(), dynamic_to_option_value(value, &declaring.to_string_lossy())?);
    }
    Ok(options)
}
