// src/engine.rs
//! The engine: the bag of shared, process-local state every node thread and
//! the resolver coordinator thread reach into, plus the top-level
//! `resolve_and_install` entry point (§6).
//!
//! Grounded on `src/main.rs`'s top-level orchestration (construct shared
//! state, hand it to the resolver, report results) — generalized from a
//! single-threaded install command into the construct-then-fan-out shape
//! this spec's concurrency model requires.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::error::{ErrorBundle, Result};
use crate::phase::Phase;
use crate::products::ProductRegistry;
use crate::registry::Registry;
use crate::script::{SandboxContext, ScriptAdapter};
use crate::spec_pool::SpecPool;

/// Everything a node's executor thread or the resolver coordinator needs,
/// shared behind one `Arc`. Each field manages its own interior
/// synchronization (§5: "the node registry, spec pool, and product
/// registry are process-local and mutex-guarded").
pub struct Engine {
    pub registry: Registry,
    pub spec_pool: SpecPool,
    pub products: ProductRegistry,
    pub cache: CacheStore,
    pub script_adapter: ScriptAdapter,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let cache = CacheStore::new(&config.cache_root, config.platform.clone(), config.arch.clone())?;
        let sandbox = SandboxContext::new(config.platform.clone(), config.arch.clone());
        Ok(Arc::new(Engine {
            registry: Registry::new(),
            spec_pool: SpecPool::new(),
            products: ProductRegistry::new(),
            cache,
            script_adapter: ScriptAdapter::new(sandbox),
            config,
        }))
    }
}

/// What a successful `resolve_and_install` run produces: every node that
/// reached completion, identified by canonical key, plus where its published
/// content (if any) ended up — `None` for user-managed nodes, which publish
/// nothing (§6).
#[derive(Debug)]
pub struct InstalledEntry {
    pub canonical_key: String,
    pub published_path: Option<PathBuf>,
    /// The node's phase at the time the summary was built — always
    /// `Completion` for a successful `resolve_and_install` run, but also
    /// reused by the `status` CLI path, where it reflects how far an
    /// already-discovered node got before the run ended.
    pub current_phase: Phase,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub installed: Vec<InstalledEntry>,
}

/// Resolve and install every recipe reachable from `manifest_roots`,
/// driving the full dependency DAG to completion (§4.6, §6). On any node
/// failure the run still waits for quiescence before returning, aggregating
/// every terminal error rather than stopping at the first (§5, §7).
pub fn resolve_and_install(config: EngineConfig, manifest_roots: &[PathBuf]) -> std::result::Result<Summary, ErrorBundle> {
    let engine = Engine::new(config).map_err(ErrorBundle::from)?;
    crate::resolver::run(&engine, manifest_roots)
}
