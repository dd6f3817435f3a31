// src/registry.rs
//! The node registry: canonical-key → `Arc<RecipeNode>` memoization, and the
//! bundle registry `recipe_fetch` consults when a dependency source resolves
//! to a spec living inside an already-fetched bundle (§4.4, §9's "bundles as
//! packages").
//!
//! Grounded on `src/resolver/mod.rs` and `src/resolver/graph.rs`, which hold
//! their package graph behind one mutex-guarded map keyed by a canonical
//! name — the same shape, specialized to spec.md's `(identity, options)`
//! canonical key and to nodes that are spawned lazily rather than all loaded
//! up front.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::node::RecipeNode;
use crate::phase::Phase;
use crate::spec_pool::RecipeSpec;

/// A bundle's declared identity, on-disk root, and the relative path of each
/// spec it contains (§6's `envy-bundle.lua`: `BUNDLE=identity`,
/// `SPECS={identity -> relative_path}`).
#[derive(Debug, Clone)]
pub struct BundleMeta {
    pub identity: String,
    pub root: PathBuf,
    pub specs: HashMap<String, PathBuf>,
}

/// Process-local node and bundle registries. Both are populated lazily as
/// the dependency DAG is discovered; neither ever removes an entry.
#[derive(Default)]
pub struct Registry {
    nodes: Mutex<HashMap<String, Arc<RecipeNode>>>,
    bundles: Mutex<HashMap<String, BundleMeta>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Idempotent node lookup-or-create keyed by the spec's canonical key
    /// (§4.4: "two dependency edges referring to the same `(identity,
    /// options)` resolve to the same node"). The `bool` is `true` iff this
    /// call allocated a new node.
    pub fn ensure_node(&self, spec: Arc<RecipeSpec>) -> (Arc<RecipeNode>, bool) {
        let key = spec.canonical_key();
        let mut nodes = self.nodes.lock().expect("registry mutex poisoned");
        if let Some(existing) = nodes.get(&key) {
            return (Arc::clone(existing), false);
        }
        let node = Arc::new(RecipeNode::new(spec));
        nodes.insert(key, Arc::clone(&node));
        (node, true)
    }

    pub fn get(&self, key: &str) -> Option<Arc<RecipeNode>> {
        self.nodes.lock().expect("registry mutex poisoned").get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<RecipeNode>> {
        self.nodes.lock().expect("registry mutex poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("registry mutex poisoned").len()
    }

    pub fn register_bundle(&self, meta: BundleMeta) {
        self.bundles
            .lock()
            .expect("bundle registry mutex poisoned")
            .insert(meta.identity.clone(), meta);
    }

    pub fn bundle(&self, identity: &str) -> Option<BundleMeta> {
        self.bundles.lock().expect("bundle registry mutex poisoned").get(identity).cloned()
    }

    /// Would attaching `from -> to` at `needed_by` create a cycle among
    /// edges at the same or a looser (numerically smaller) `needed_by`
    /// level? Only same-level edges can actually deadlock the phase
    /// barrier, since an edge with a later `needed_by` never blocks a
    /// phase earlier than it (§4.5's cycle-rejection note). Returns the
    /// identity path of the cycle, starting and ending at `from`'s key, if
    /// one would be created.
    pub fn would_create_cycle(&self, from: &Arc<RecipeNode>, to: &Arc<RecipeNode>, needed_by: Phase) -> Option<Vec<String>> {
        let from_key = from.canonical_key();
        let to_key = to.canonical_key();
        if from_key == to_key {
            return Some(vec![from_key.clone(), to_key]);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![vec![to_key]];
        while let Some(path) = stack.pop() {
            let current_key = path.last().expect("path is never empty").clone();
            if !visited.insert(current_key.clone()) {
                continue;
            }
            let Some(current_node) = self.get(&current_key) else {
                continue;
            };
            let deps = current_node.dependencies.lock().expect("dependencies mutex poisoned");
            for (dep, dep_needed_by) in deps.values() {
                if *dep_needed_by > needed_by {
                    continue;
                }
                let dep_key = dep.canonical_key();
                if dep_key == from_key {
                    let mut full = vec![from_key.clone()];
                    full.extend(path.iter().cloned());
                    full.push(dep_key);
                    return Some(full);
                }
                let mut next_path = path.clone();
                next_path.push(dep_key);
                stack.push(next_path);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::options::Options;
    use crate::spec_pool::SourceDescriptor;

    fn spec(name: &str) -> Arc<RecipeSpec> {
        Arc::new(RecipeSpec {
            identity: Identity::new("local", name, "r1"),
            options: Options::new(),
            source: SourceDescriptor::WeakOrReference,
            declaring_file: PathBuf::new(),
            needed_by: None,
            product_name: None,
            declared_dependencies: Vec::new(),
            is_custom_fetch: false,
        })
    }

    #[test]
    fn ensure_node_memoizes_by_canonical_key() {
        let registry = Registry::new();
        let (a, created_a) = registry.ensure_node(spec("tool"));
        let (b, created_b) = registry.ensure_node(spec("tool"));
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_specs_get_distinct_nodes() {
        let registry = Registry::new();
        let (a, _) = registry.ensure_node(spec("a"));
        let (b, _) = registry.ensure_node(spec("b"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn direct_self_edge_is_a_cycle() {
        let registry = Registry::new();
        let (a, _) = registry.ensure_node(spec("a"));
        let cycle = registry.would_create_cycle(&a, &a, Phase::Fetch);
        assert!(cycle.is_some());
    }

    #[test]
    fn a_to_b_to_a_is_detected_once_b_already_depends_on_a() {
        let registry = Registry::new();
        let (a, _) = registry.ensure_node(spec("a"));
        let (b, _) = registry.ensure_node(spec("b"));
        b.record_dependency(a.canonical_key(), Arc::clone(&a), Phase::Fetch);

        let cycle = registry.would_create_cycle(&a, &b, Phase::Fetch);
        assert!(cycle.is_some());
        let path = cycle.unwrap();
        assert_eq!(path.first(), Some(&a.canonical_key()));
        assert_eq!(path.last(), Some(&a.canonical_key()));
    }

    #[test]
    fn no_cycle_for_an_independent_chain() {
        let registry = Registry::new();
        let (a, _) = registry.ensure_node(spec("a"));
        let (b, _) = registry.ensure_node(spec("b"));
        let (c, _) = registry.ensure_node(spec("c"));
        b.record_dependency(c.canonical_key(), Arc::clone(&c), Phase::Fetch);

        assert!(registry.would_create_cycle(&a, &b, Phase::Fetch).is_none());
    }

    #[test]
    fn a_looser_needed_by_on_the_existing_edge_does_not_block() {
        let registry = Registry::new();
        let (a, _) = registry.ensure_node(spec("a"));
        let (b, _) = registry.ensure_node(spec("b"));
        // b -> a only at Install; a new a -> b edge needed only by RecipeFetch
        // cannot actually deadlock, since the phase barrier for the new edge
        // never waits past RecipeFetch.
        b.record_dependency(a.canonical_key(), Arc::clone(&a), Phase::Install);

        assert!(registry.would_create_cycle(&a, &b, Phase::RecipeFetch).is_none());
    }
}
