// src/spec_pool.rs
//! Recipe specs and the process-wide pool that owns them (§3, §4.4).
//!
//! Specs are immutable after parse and must outlive any reference handed to
//! a caller for the duration of a resolution run. `Arc<RecipeSpec>` is the
//! idiomatic Rust analogue of the append-only arena with stable interior
//! pointers spec.md's design notes call for: the allocation never moves and
//! every clone is a cheap refcount bump, so a `RecipeNode` can hold on to its
//! spec for as long as it lives without the pool itself needing unsafe code.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::identity::{Identity, IdentityQuery};
use crate::options::Options;
use crate::phase::Phase;

/// Where a recipe's script (or, for a weak/reference-only spec, nothing)
/// comes from.
#[derive(Debug, Clone)]
pub enum SourceDescriptor {
    Remote {
        url: String,
        sha256: Option<String>,
    },
    Local {
        path: PathBuf,
    },
    Git {
        url: String,
        git_ref: String,
    },
    CustomFetch {
        /// Shell command that produces this recipe's script content inside a
        /// scratch `tmp_dir`, given the narrow `fetch`/`commit_fetch`
        /// binding surface §4.7 describes — there is no script yet to host
        /// a named function, so this is a command line, not a callable.
        command: String,
        /// Prerequisites that must themselves reach `recipe_fetch` before
        /// `command` runs (§9's "source prerequisite").
        source_dependencies: Vec<Arc<RecipeSpec>>,
    },
    /// This spec's script lives inside an `envy-bundle.lua` descriptor
    /// rather than having its own independent cache entry: `bundle_path`
    /// names the descriptor file, opened directly (no fetch or cache entry
    /// of its own — a bundle is a local manifest, not a recipe) and
    /// `bundle_path`'s `SPECS` table is consulted for this spec's own
    /// script path (§6, §9's "bundles as packages").
    Bundle { bundle_path: PathBuf },
    /// Weak/reference-only: no source, carries only a query.
    WeakOrReference,
}

/// A single dependency declaration as it appeared in a recipe (or manifest).
#[derive(Debug, Clone)]
pub enum DepDeclaration {
    /// Concrete spec with its own source — produces a node immediately.
    Strong(Arc<RecipeSpec>),
    /// Partial-identity query with an optional fallback spec.
    Weak {
        query: IdentityQuery,
        fallback: Option<Arc<RecipeSpec>>,
        needed_by: Phase,
        product: Option<String>,
    },
    /// A dependency referenced by product name rather than identity.
    Product {
        name: String,
        fallback: Option<Arc<RecipeSpec>>,
        needed_by: Phase,
        /// Optional identity constraint the eventual provider must satisfy.
        constraint: Option<IdentityQuery>,
    },
}

/// An immutable recipe spec. Created only through `SpecPool::insert`.
#[derive(Debug)]
pub struct RecipeSpec {
    pub identity: Identity,
    pub options: Options,
    pub source: SourceDescriptor,
    /// Path of the file that declared this spec (manifest or parent recipe),
    /// kept for provenance in diagnostics.
    pub declaring_file: PathBuf,
    /// Phase at which a dependent blocks on this spec, when this spec is
    /// itself a dependency (`None` for manifest roots).
    pub needed_by: Option<Phase>,
    /// Product name this spec satisfies, when it was instantiated to serve
    /// a product dependency.
    pub product_name: Option<String>,
    /// Declared dependencies, in declaration order, for provenance and for
    /// `recipe_fetch` to wire.
    pub declared_dependencies: Vec<DepDeclaration>,
    /// `FETCH`/`STAGE`/etc custom-fetch marker: true if this spec's source
    /// is a `CustomFetch` descriptor.
    pub is_custom_fetch: bool,
}

impl RecipeSpec {
    fn new(
        identity: Identity,
        options: Options,
        source: SourceDescriptor,
        declaring_file: PathBuf,
        needed_by: Option<Phase>,
        product_name: Option<String>,
    ) -> Self {
        let is_custom_fetch = matches!(source, SourceDescriptor::CustomFetch { .. });
        RecipeSpec {
            identity,
            options,
            source,
            declaring_file,
            needed_by,
            product_name,
            declared_dependencies: Vec::new(),
            is_custom_fetch,
        }
    }

    pub fn canonical_key(&self) -> String {
        crate::options::canonical_key(&self.identity, &self.options)
    }
}

/// Process-wide, append-only, mutex-guarded pool of specs. All spec creation
/// goes through `insert`; nothing ever removes or mutates an entry.
#[derive(Debug, Default)]
pub struct SpecPool {
    specs: Mutex<Vec<Arc<RecipeSpec>>>,
}

impl SpecPool {
    pub fn new() -> Self {
        Self {
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Build and register a new spec. Building happens entirely before the
    /// lock is taken so contention on the pool mutex stays proportional to
    /// the actual append, not to parsing work.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        identity: Identity,
        options: Options,
        source: SourceDescriptor,
        declaring_file: PathBuf,
        needed_by: Option<Phase>,
        product_name: Option<String>,
        declared_dependencies: Vec<DepDeclaration>,
    ) -> Arc<RecipeSpec> {
        let mut spec = RecipeSpec::new(identity, options, source, declaring_file, needed_by, product_name);
        spec.declared_dependencies = declared_dependencies;
        let arc = Arc::new(spec);
        self.specs.lock().expect("spec pool mutex poisoned").push(arc.clone());
        arc
    }

    pub fn len(&self) -> usize {
        self.specs.lock().expect("spec pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_returns_stable_shared_spec() {
        let pool = SpecPool::new();
        let spec = pool.insert(
            Identity::new("local", "tool", "r1"),
            Options::new(),
            SourceDescriptor::Local {
                path: "./tool.lua".into(),
            },
            PathBuf::from("manifest.toml"),
            None,
            None,
            Vec::new(),
        );
        assert_eq!(spec.identity.to_string(), "local.tool@r1");
        assert_eq!(pool.len(), 1);

        // Clones are cheap refcount bumps to the same allocation.
        let clone = spec.clone();
        assert!(Arc::ptr_eq(&spec, &clone));
    }

    #[test]
    fn pool_never_shrinks() {
        let pool = SpecPool::new();
        for i in 0..5 {
            pool.insert(
                Identity::new("local", format!("pkg{i}"), "r1"),
                Options::new(),
                SourceDescriptor::WeakOrReference,
                PathBuf::new(),
                None,
                None,
                Vec::new(),
            );
        }
        assert_eq!(pool.len(), 5);
    }
}
