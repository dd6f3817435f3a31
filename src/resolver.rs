// src/resolver.rs
//! The resolver loop (§4.6): seeds manifest roots, drives the recipe-fetch
//! closure, then iteratively resolves weak/reference-only and product
//! dependencies by matching the current node set and spawning fallbacks,
//! until the pass makes no further progress.
//!
//! Grounded on `src/resolver/mod.rs`'s `resolve()` entry point, which loops
//! "expand dependency graph, reconcile, check for convergence" until a fixed
//! point — the same shape, specialized from package-manifest locking to
//! spec.md's weak-reference/fallback convergence rule.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::{Engine, InstalledEntry, Summary};
use crate::error::{Error, ErrorBundle};
use crate::identity::{matches, IdentityQuery};
use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::scheduler;

/// Run a full resolve-and-install pass over `manifest_roots`, returning
/// every installed node on success or the full set of errors encountered.
pub fn run(engine: &Arc<Engine>, manifest_roots: &[PathBuf]) -> Result<Summary, ErrorBundle> {
    let mut errors = ErrorBundle::new();

    seed_roots(engine, manifest_roots, &mut errors);
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut seen_recipe_fetched = HashSet::new();
    let mut fallback_products: Vec<(Arc<RecipeNode>, String)> = Vec::new();
    let mut last_collisions: Vec<Error> = Vec::new();

    loop {
        for err in wait_for_resolution_phase(engine, &mut seen_recipe_fetched) {
            errors.push(err);
        }
        if !errors.is_empty() {
            break;
        }

        last_collisions = engine.products.rebuild(&engine.registry.all());

        let progress = resolve_pending_weak_refs(engine, &mut errors, &mut fallback_products);
        if progress.resolved == 0 && progress.fallbacks_spawned == 0 {
            break;
        }
    }

    if errors.is_empty() {
        errors.extend(ErrorBundle { errors: last_collisions });
    }
    if errors.is_empty() {
        validate_remaining(engine, &mut errors);
    }
    if errors.is_empty() {
        for (fallback, product) in &fallback_products {
            if let Err(err) = crate::products::validate_fallback_provides(fallback, product) {
                errors.push(err);
            }
        }
    }

    if !errors.is_empty() {
        join_all(engine);
        return Err(errors);
    }

    for node in engine.registry.all() {
        scheduler::start_to(engine, &node, Phase::Completion, &[]);
    }
    for node in engine.registry.all() {
        let _ = scheduler::ensure_at(&node, Phase::Completion);
    }

    for node in engine.registry.all() {
        if let Some(err) = node.phase.terminal_error() {
            errors.push(synth_error(&node, &err));
        }
    }

    join_all(engine);

    if !errors.is_empty() {
        return Err(errors);
    }

    let installed = engine
        .registry
        .all()
        .into_iter()
        .map(|node| InstalledEntry {
            canonical_key: node.canonical_key(),
            published_path: node.asset_path.lock().expect("asset_path mutex poisoned").clone(),
            current_phase: node.phase.current(),
        })
        .collect();

    Ok(Summary { installed })
}

fn join_all(engine: &Engine) {
    for node in engine.registry.all() {
        node.join();
    }
}

/// Build a fresh `Error::PhaseFailure` from a node's recorded terminal
/// `Arc<Error>` — `Error` itself isn't `Clone` (it wraps `std::io::Error`),
/// so aggregation re-derives a bundle-able value from the message instead.
fn synth_error(node: &RecipeNode, err: &Arc<Error>) -> Error {
    Error::PhaseFailure {
        identity: node.canonical_key(),
        phase: node.phase.current(),
        message: err.to_string(),
        script_location: None,
    }
}

fn seed_roots(engine: &Arc<Engine>, manifest_roots: &[PathBuf], errors: &mut ErrorBundle) {
    for manifest_path in manifest_roots {
        let roots = match crate::manifest::load_manifest(manifest_path) {
            Ok(roots) => roots,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        for root in roots {
            let spec = engine.spec_pool.insert(
                root.identity,
                root.options,
                root.source,
                manifest_path.clone(),
                None,
                None,
                Vec::new(),
            );
            let (node, _created) = engine.registry.ensure_node(spec);
            scheduler::start_to(engine, &node, Phase::Completion, &[]);
        }
    }
}

/// Block until every node discovered so far reaches at least `recipe_fetch`,
/// looping as long as new nodes keep appearing (a dependent's own
/// `recipe_fetch` can register new strong-dependency nodes). `seen` persists
/// across calls so already-settled nodes are never re-awaited.
fn wait_for_resolution_phase(engine: &Engine, seen: &mut HashSet<String>) -> Vec<Error> {
    let mut errors = Vec::new();
    loop {
        let nodes = engine.registry.all();
        let unseen: Vec<Arc<RecipeNode>> = nodes.into_iter().filter(|n| !seen.contains(&n.canonical_key())).collect();
        if unseen.is_empty() {
            break;
        }
        for node in unseen {
            let key = node.canonical_key();
            if let Err(err) = node.phase.wait_until_at_least(Phase::RecipeFetch) {
                errors.push(synth_error(&node, &err));
            }
            seen.insert(key);
        }
    }
    errors
}

struct Progress {
    resolved: usize,
    fallbacks_spawned: usize,
}

/// One pass over every node's `weak_references`: wire any reference with
/// exactly one candidate, spawn a fallback for any reference with none,
/// report ambiguity for any reference with more than one, and leave
/// zero-candidate/no-fallback references pending for the next pass.
fn resolve_pending_weak_refs(engine: &Arc<Engine>, errors: &mut ErrorBundle, fallback_products: &mut Vec<(Arc<RecipeNode>, String)>) -> Progress {
    let mut progress = Progress {
        resolved: 0,
        fallbacks_spawned: 0,
    };

    let nodes = engine.registry.all();
    for node in &nodes {
        let pending: Vec<usize> = node
            .weak_references
            .lock()
            .expect("weak_references mutex poisoned")
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.resolved)
            .map(|(i, _)| i)
            .collect();

        for index in pending {
            let (query, fallback, needed_by, product, constraint) = {
                let refs = node.weak_references.lock().expect("weak_references mutex poisoned");
                let r = &refs[index];
                (r.query.clone(), r.fallback.clone(), r.needed_by, r.product.clone(), r.constraint.clone())
            };

            let outcome = if let Some(name) = &product {
                resolve_product_ref(engine, node, name, constraint.as_ref(), &nodes)
            } else {
                resolve_identity_ref(&query, &nodes, &node.canonical_key())
            };
            // Zero matches with a fallback spec on hand means "spawn it",
            // not "wait another pass" — only reference-only deps (no
            // fallback) actually stay pending on zero matches (§4.6).
            let outcome = match outcome {
                RefOutcome::Pending if fallback.is_some() => RefOutcome::SpawnFallback,
                other => other,
            };

            match outcome {
                RefOutcome::Settled(Some(target)) => {
                    if let Err(err) = wire_resolved(engine, node, &target, needed_by, &[]) {
                        errors.push(err);
                    }
                    mark_resolved(node, index);
                    progress.resolved += 1;
                }
                RefOutcome::Settled(None) => {
                    mark_resolved(node, index);
                    progress.resolved += 1;
                }
                RefOutcome::Ambiguous(err) => {
                    errors.push(err);
                    mark_resolved(node, index);
                    progress.resolved += 1;
                }
                RefOutcome::SpawnFallback => {
                    let fallback_spec = fallback.expect("SpawnFallback only returned when a fallback exists");
                    let (fallback_node, _created) = engine.registry.ensure_node(Arc::clone(&fallback_spec));
                    if let Err(err) = wire_resolved(engine, node, &fallback_node, needed_by, &[]) {
                        errors.push(err);
                    } else {
                        scheduler::start_to(engine, &fallback_node, Phase::Completion, &[node.canonical_key()]);
                        if let Some(name) = &product {
                            fallback_products.push((Arc::clone(&fallback_node), name.clone()));
                        }
                    }
                    mark_resolved(node, index);
                    progress.fallbacks_spawned += 1;
                }
                RefOutcome::Pending => {}
            }
        }
    }

    progress
}

enum RefOutcome {
    /// Resolved to a concrete node, or (for a constraint mismatch already
    /// reported elsewhere) settled with nothing further to wire.
    Settled(Option<Arc<RecipeNode>>),
    Ambiguous(Error),
    SpawnFallback,
    Pending,
}

/// Zero matches is reported to the caller as `Pending` either way; the
/// caller reinterprets it as `SpawnFallback` when the reference carries a
/// fallback spec, and as a genuinely-still-pending reference-only dep when
/// it doesn't (§4.6).
fn resolve_identity_ref(query: &IdentityQuery, nodes: &[Arc<RecipeNode>], declaring: &str) -> RefOutcome {
    let matched: Vec<&Arc<RecipeNode>> = nodes.iter().filter(|n| matches(query, &n.spec.identity)).collect();
    match matched.len() {
        1 => RefOutcome::Settled(Some(Arc::clone(matched[0]))),
        0 => RefOutcome::Pending,
        _ => RefOutcome::Ambiguous(Error::AmbiguousReference {
            query: query.to_string(),
            declaring: declaring.to_string(),
            candidates: matched.iter().map(|n| n.canonical_key()).collect(),
        }),
    }
}

fn resolve_product_ref(
    engine: &Arc<Engine>,
    node: &Arc<RecipeNode>,
    name: &str,
    constraint: Option<&IdentityQuery>,
    _nodes: &[Arc<RecipeNode>],
) -> RefOutcome {
    let Some(provider_key) = engine.products.find_provider_node(name) else {
        return RefOutcome::Pending;
    };
    let Some(provider) = engine.registry.get(&provider_key) else {
        return RefOutcome::Pending;
    };
    if let Some(constraint) = constraint {
        if !matches(constraint, &provider.spec.identity) {
            return RefOutcome::Ambiguous(Error::MissingReference {
                query: format!("product '{name}' (constrained to {constraint})"),
                declaring: node.canonical_key(),
            });
        }
    }
    RefOutcome::Settled(Some(provider))
}

fn mark_resolved(node: &RecipeNode, index: usize) {
    node.weak_references.lock().expect("weak_references mutex poisoned")[index].resolved = true;
}

fn wire_resolved(engine: &Arc<Engine>, node: &Arc<RecipeNode>, target: &Arc<RecipeNode>, needed_by: Phase, chain: &[String]) -> Result<(), Error> {
    if let Some(cycle) = engine.registry.would_create_cycle(node, target, needed_by) {
        return Err(Error::Cycle { path: cycle });
    }
    node.record_dependency(target.canonical_key(), Arc::clone(target), needed_by);
    scheduler::start_to(engine, target, Phase::Completion, chain);
    Ok(())
}

/// Every weak reference that never settled (zero candidates, no fallback)
/// is a hard failure once the main loop has converged.
fn validate_remaining(engine: &Engine, errors: &mut ErrorBundle) {
    for node in engine.registry.all() {
        let refs = node.weak_references.lock().expect("weak_references mutex poisoned");
        for r in refs.iter().filter(|r| !r.resolved) {
            let query = match &r.product {
                Some(name) => format!("product '{name}'"),
                None => r.query.to_string(),
            };
            errors.push(Error::MissingReference {
                query,
                declaring: node.canonical_key(),
            });
        }
    }
}
