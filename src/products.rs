// src/products.rs
//! Product/alias registry (§4.8): every node's declared `PRODUCTS` entries
//! feed one flat namespace; a name claimed by more than one node is a
//! collision, not a priority contest.
//!
//! Grounded on `src/resolver/graph.rs`'s provider-registry pattern
//! (`DependencyGraph` tracking which package node satisfies which named
//! capability) — generalized here from "package provides capability" to
//! "recipe provides named product", with collision reporting substituted
//! for the teacher's priority-based conflict resolution, since spec.md
//! explicitly rejects priority rules for products (§4.8).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::node::RecipeNode;

#[derive(Debug, Clone)]
struct Provider {
    node_key: String,
    value: String,
}

/// Mutex-guarded map from product name to its provider(s). Rebuilt from
/// scratch on every resolver pass (`rebuild_product_registry`, §4.6) rather
/// than incrementally maintained, since a node's products never change once
/// it clears `recipe_fetch`.
#[derive(Default)]
pub struct ProductRegistry {
    providers: Mutex<HashMap<String, Vec<Provider>>>,
}

impl ProductRegistry {
    pub fn new() -> Self {
        ProductRegistry::default()
    }

    /// Recompute the registry from every node that has passed
    /// `recipe_fetch`. Returns every collision found (one error per name
    /// with more than one provider) rather than stopping at the first.
    pub fn rebuild(&self, nodes: &[Arc<RecipeNode>]) -> Vec<Error> {
        let mut by_name: HashMap<String, Vec<Provider>> = HashMap::new();
        for node in nodes {
            let products = node.products.lock().expect("products mutex poisoned");
            for (name, value) in products.iter() {
                by_name.entry(name.clone()).or_default().push(Provider {
                    node_key: node.canonical_key(),
                    value: value.clone(),
                });
            }
        }

        let mut collisions = Vec::new();
        for (name, providers) in by_name.iter() {
            if providers.len() > 1 {
                collisions.push(Error::ProductCollision {
                    name: name.clone(),
                    first: providers[0].node_key.clone(),
                    second: providers[1].node_key.clone(),
                });
            }
        }

        *self.providers.lock().expect("providers mutex poisoned") = by_name;
        collisions
    }

    /// The single provider's declared value, or `None` if there is no
    /// provider or more than one (a collision already reported by
    /// `rebuild`, so callers never need to re-derive "ambiguous").
    pub fn find_provider(&self, name: &str) -> Option<String> {
        let providers = self.providers.lock().expect("providers mutex poisoned");
        match providers.get(name) {
            Some(list) if list.len() == 1 => Some(list[0].value.clone()),
            _ => None,
        }
    }

    /// The single provider's node key — distinct from `find_provider`'s
    /// value, since wiring a product-dependency edge needs the providing
    /// node itself, not just its advertised string (§4.5, §4.6).
    pub fn find_provider_node(&self, name: &str) -> Option<String> {
        let providers = self.providers.lock().expect("providers mutex poisoned");
        match providers.get(name) {
            Some(list) if list.len() == 1 => Some(list[0].node_key.clone()),
            _ => None,
        }
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers
            .lock()
            .expect("providers mutex poisoned")
            .get(name)
            .is_some_and(|list| !list.is_empty())
    }
}

/// DFS through `fallback`'s transitive dependency closure, confirming it (or
/// something it depends on, directly or indirectly) provides `product`
/// (§4.8's fallback validation, run once weak-reference convergence is
/// done).
pub fn validate_fallback_provides(fallback: &Arc<RecipeNode>, product: &str) -> Result<()> {
    let mut visited = std::collections::HashSet::new();
    let mut stack = vec![Arc::clone(fallback)];
    while let Some(node) = stack.pop() {
        let key = node.canonical_key();
        if !visited.insert(key) {
            continue;
        }
        if node.products.lock().expect("products mutex poisoned").contains_key(product) {
            return Ok(());
        }
        let deps: Vec<_> = node
            .dependencies
            .lock()
            .expect("dependencies mutex poisoned")
            .values()
            .map(|(dep, _)| Arc::clone(dep))
            .collect();
        stack.extend(deps);
    }
    Err(Error::ProductFallbackInvalid {
        fallback: fallback.canonical_key(),
        product: product.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::options::Options;
    use crate::spec_pool::{RecipeSpec, SourceDescriptor};
    use std::path::PathBuf;

    fn node(name: &str) -> Arc<RecipeNode> {
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
    fn single_provider_is_found() {
        let a = node("a");
        a.add_product("compiler".into(), "local.a@r1".into());
        let key = a.canonical_key();
        let registry = ProductRegistry::new();
        let collisions = registry.rebuild(&[a]);
        assert!(collisions.is_empty());
        assert_eq!(registry.find_provider("compiler"), Some("local.a@r1".into()));
        assert_eq!(registry.find_provider_node("compiler"), Some(key));
    }

    #[test]
    fn two_providers_of_the_same_name_collide() {
        let a = node("a");
        let b = node("b");
        a.add_product("compiler".into(), "local.a@r1".into());
        b.add_product("compiler".into(), "local.b@r1".into());

        let registry = ProductRegistry::new();
        let collisions = registry.rebuild(&[a, b]);
        assert_eq!(collisions.len(), 1);
        assert!(matches!(collisions[0], Error::ProductCollision { .. }));
        assert_eq!(registry.find_provider("compiler"), None);
    }

    #[test]
    fn fallback_providing_directly_validates() {
        let fallback = node("fallback");
        fallback.add_product("compiler".into(), "local.fallback@r1".into());
        assert!(validate_fallback_provides(&fallback, "compiler").is_ok());
    }

    #[test]
    fn fallback_providing_transitively_validates() {
        let fallback = node("fallback");
        let inner = node("inner");
        inner.add_product("compiler".into(), "local.inner@r1".into());
        fallback.record_dependency(inner.canonical_key(), Arc::clone(&inner), crate::phase::Phase::Fetch);

        assert!(validate_fallback_provides(&fallback, "compiler").is_ok());
    }

    #[test]
    fn fallback_never_providing_is_rejected() {
        let fallback = node("fallback");
        let err = validate_fallback_provides(&fallback, "compiler").unwrap_err();
        assert!(matches!(err, Error::ProductFallbackInvalid { .. }));
    }
}
