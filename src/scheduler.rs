// src/scheduler.rs
//! Per-node executor threads and the `start_to`/`ensure_at` coordination
//! surface (§4.5). One OS thread runs a node's entire phase progression;
//! `start_to` spawns it lazily and "extends" its target, `ensure_at` blocks
//! a caller on a phase without caring who (if anyone) is driving it there.
//!
//! Grounded on `src/resolver/engine.rs`'s resolve-loop shape and
//! `src/transaction/mod.rs`'s phase state machine, re-cast from a single
//! coordinator thread stepping a list of transactions into one thread per
//! node stepping itself, synchronized through `node::PhaseSync` instead of
//! a shared journal.

use std::sync::Arc;
use std::thread;

use crate::engine::Engine;
use crate::error::Error;
use crate::node::RecipeNode;
use crate::phase::Phase;

/// Ensure `node` has a running executor thread, and that its target phase
/// is at least `target` ("target extension": raising it is always safe, it
/// never decreases work already promised, §4.5/§9).
///
/// `ancestor_chain` is the dependency path that led here, carried purely
/// for diagnostics (it has no bearing on scheduling — cycle rejection
/// happens earlier, at dependency-attachment time, in
/// `Registry::would_create_cycle`).
pub fn start_to(engine: &Arc<Engine>, node: &Arc<RecipeNode>, target: Phase, ancestor_chain: &[String]) {
    node.phase.raise_target(target);

    let engine = Arc::clone(engine);
    let chain = ancestor_chain.to_vec();
    node.start_executor_once(move |node| {
        thread::Builder::new()
            .name(format!("envy-node-{}", node.canonical_key()))
            .spawn(move || run_node(engine, node, chain))
            .expect("failed to spawn node executor thread")
    });
}

/// Block the caller until `node` reaches `phase`, or propagate its terminal
/// error if it failed first.
pub fn ensure_at(node: &Arc<RecipeNode>, phase: Phase) -> Result<(), Arc<Error>> {
    node.phase.wait_until_at_least(phase)
}

/// The executor thread body: step the node forward one phase at a time
/// until its target is reached (§4.5's per-node loop pseudocode).
fn run_node(engine: Arc<Engine>, node: Arc<RecipeNode>, ancestor_chain: Vec<String>) {
    loop {
        let Some(next) = node.phase.wait_for_next_phase() else {
            return;
        };

        if let Err(dep_err) = wait_for_dependencies(&node, next) {
            node.phase.fail(Error::PhaseFailure {
                identity: node.spec.identity.to_string(),
                phase: next,
                message: format!("blocked dependency failed: {dep_err}"),
                script_location: None,
            });
            return;
        }

        let mut chain = ancestor_chain.clone();
        chain.push(node.canonical_key());
        let outcome = match crate::handlers::run_phase(&engine, &node, next, &chain) {
            Ok(outcome) => outcome,
            Err(err) => {
                node.phase.fail(err);
                return;
            }
        };

        match outcome {
            crate::handlers::PhaseOutcome::SkipToCompletion => {
                node.phase.advance_to(Phase::Completion);
                return;
            }
            crate::handlers::PhaseOutcome::Continue => {
                node.phase.advance_to(next);
                if next == Phase::Completion {
                    return;
                }
            }
        }
    }
}

/// Block on every dependency whose `needed_by` is at or before `next`
/// reaching `Completion` (§4.5: "a node may not enter phase P until every
/// dependency with `needed_by <= P` has reached completion").
fn wait_for_dependencies(node: &Arc<RecipeNode>, next: Phase) -> Result<(), Arc<Error>> {
    let deps: Vec<_> = node
        .dependencies
        .lock()
        .expect("dependencies mutex poisoned")
        .values()
        .cloned()
        .collect();
    for (dep, needed_by) in deps {
        if next >= needed_by {
            dep.phase.wait_until_at_least(Phase::Completion)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::EngineConfig;
    use crate::identity::Identity;
    use crate::options::Options;
    use crate::registry::Registry;
    use crate::script::{SandboxContext, ScriptAdapter};
    use crate::spec_pool::{RecipeSpec, SourceDescriptor, SpecPool};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_engine(cache_root: &std::path::Path) -> Arc<Engine> {
        Arc::new(Engine {
            registry: Registry::new(),
            spec_pool: SpecPool::new(),
            products: crate::products::ProductRegistry::new(),
            cache: CacheStore::new(cache_root, "linux", "x86_64").unwrap(),
            script_adapter: ScriptAdapter::new(SandboxContext::new("linux", "x86_64")),
            config: EngineConfig::default(),
        })
    }

    fn leaf_node(name: &str) -> Arc<RecipeNode> {
        Arc::new(RecipeNode::new(Arc::new(RecipeSpec {
            identity: Identity::new("local", name, "r1"),
            options: Options::new(),
            source: SourceDescriptor::WeakOrReference,
            declaring_file: PathBuf::new(),
            needed_by: None,
            product_name: None,
            declared_dependencies: Vec::new(),
            is_custom_fetch: false,
        })))
    }

    #[test]
    fn a_node_with_no_dependencies_and_no_phase_verbs_reaches_completion() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());
        let node = leaf_node("leaf");

        start_to(&engine, &node, Phase::Completion, &[]);
        assert!(ensure_at(&node, Phase::Completion).is_ok());
        node.join();
    }

    #[test]
    fn raising_the_target_again_does_not_spawn_a_second_thread() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());
        let node = leaf_node("leaf");

        start_to(&engine, &node, Phase::Check, &[]);
        start_to(&engine, &node, Phase::Completion, &[]);
        assert!(ensure_at(&node, Phase::Completion).is_ok());
        node.join();
    }

    #[test]
    fn a_dependent_waits_for_its_dependency_to_complete() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());
        let dependency = leaf_node("dep");
        let dependent = leaf_node("dependent");
        dependent.record_dependency(dependency.canonical_key(), Arc::clone(&dependency), Phase::Fetch);

        start_to(&engine, &dependency, Phase::Completion, &[]);
        start_to(&engine, &dependent, Phase::Completion, &[]);

        assert!(ensure_at(&dependent, Phase::Completion).is_ok());
        assert_eq!(dependency.phase.current(), Phase::Completion);
        dependency.join();
        dependent.join();
    }
}
