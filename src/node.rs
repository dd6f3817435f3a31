// src/node.rs
//! Recipe node: one in-memory instantiation of a recipe at a specific
//! canonical key, its phase synchronization, dependency edges, weak
//! references, and discovered products (§3, §4.4, §4.5).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::cache::ScopedLock;
use crate::error::Error;
use crate::identity::IdentityQuery;
use crate::phase::Phase;
use crate::script::ScriptState;
use crate::spec_pool::RecipeSpec;

/// A recorded weak or reference-only dependency, pending resolution by the
/// resolver loop (§4.6).
#[derive(Debug)]
pub struct WeakReference {
    pub query: IdentityQuery,
    pub fallback: Option<Arc<RecipeSpec>>,
    pub needed_by: Phase,
    pub resolved: bool,
    pub product: Option<String>,
    pub constraint: Option<IdentityQuery>,
}

/// `(current_phase, target_phase, terminal_error)` guarded by one mutex, and
/// the condition variable waiters block on — exactly the "one condition
/// variable + mutex per node" design spec.md §9 calls for.
///
/// `current: None` is the pre-start sentinel: no phase has run yet, so the
/// executor's very first step must be `recipe_fetch` regardless of how high
/// `target` already sits (a freshly seeded node gets its target raised to
/// `Completion` before its executor thread ever wakes).
struct PhaseInner {
    current: Option<Phase>,
    target: Phase,
    terminal_error: Option<Arc<Error>>,
}

pub struct PhaseSync {
    inner: Mutex<PhaseInner>,
    cond: Condvar,
}

impl PhaseSync {
    fn new() -> Self {
        PhaseSync {
            inner: Mutex::new(PhaseInner {
                current: None,
                target: Phase::RecipeFetch,
                terminal_error: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// The last phase this node actually finished running. Reports
    /// `RecipeFetch` before anything has run — the phase the node is about
    /// to enter is the most useful label for a not-yet-started node.
    pub fn current(&self) -> Phase {
        self.inner.lock().expect("phase mutex poisoned").current.unwrap_or(Phase::RecipeFetch)
    }

    pub fn target(&self) -> Phase {
        self.inner.lock().expect("phase mutex poisoned").target
    }

    pub fn terminal_error(&self) -> Option<Arc<Error>> {
        self.inner.lock().expect("phase mutex poisoned").terminal_error.clone()
    }

    /// Atomically raise `target` to `max(target, requested)` ("target
    /// extension", §4.5/§9), notifying any executor thread waiting on it.
    pub fn raise_target(&self, requested: Phase) {
        let mut inner = self.inner.lock().expect("phase mutex poisoned");
        if requested > inner.target {
            inner.target = requested;
            self.cond.notify_all();
        }
    }

    /// Record `next` as having just finished running. Caller (the node's
    /// own executor thread) guarantees `next` is the phase `wait_for_next_phase`
    /// just handed it.
    pub fn advance_to(&self, next: Phase) {
        let mut inner = self.inner.lock().expect("phase mutex poisoned");
        debug_assert!(inner.current.is_none_or(|c| next >= c));
        inner.current = Some(next);
        self.cond.notify_all();
    }

    /// Record a terminal failure. Distinct from reaching `Completion`:
    /// waiters observe this and propagate a dependency-failure error rather
    /// than proceeding (§5).
    pub fn fail(&self, err: Error) {
        let mut inner = self.inner.lock().expect("phase mutex poisoned");
        if inner.terminal_error.is_none() {
            inner.terminal_error = Some(Arc::new(err));
            self.cond.notify_all();
        }
    }

    /// Block until `current >= phase` (i.e. `phase` has actually finished
    /// running) or a terminal error is recorded. Never satisfied by the
    /// pre-start sentinel, even for `phase == RecipeFetch`.
    pub fn wait_until_at_least(&self, phase: Phase) -> Result<(), Arc<Error>> {
        let mut inner = self.inner.lock().expect("phase mutex poisoned");
        loop {
            if let Some(err) = &inner.terminal_error {
                return Err(err.clone());
            }
            if inner.current.is_some_and(|c| c >= phase) {
                return Ok(());
            }
            inner = self.cond.wait(inner).expect("phase mutex poisoned");
        }
    }

    /// Block until there's a next phase to run — `recipe_fetch` on the very
    /// first call, then `current.next()` once `target` has been extended
    /// far enough — or shutdown is signaled via a terminal error or
    /// `current` already sitting at `Completion`.
    pub fn wait_for_next_phase(&self) -> Option<Phase> {
        let mut inner = self.inner.lock().expect("phase mutex poisoned");
        loop {
            if inner.terminal_error.is_some() {
                return None;
            }
            let candidate = match inner.current {
                None => Some(Phase::RecipeFetch),
                Some(c) => c.next(),
            };
            match candidate {
                None => return None,
                Some(next) if inner.target >= next => return Some(next),
                Some(_) => {}
            }
            inner = self.cond.wait(inner).expect("phase mutex poisoned");
        }
    }
}

/// One instantiation of a recipe at a specific `(identity, options)`.
pub struct RecipeNode {
    pub spec: Arc<RecipeSpec>,
    pub phase: PhaseSync,
    pub dependencies: Mutex<HashMap<String, (Arc<RecipeNode>, Phase)>>,
    pub weak_references: Mutex<Vec<WeakReference>>,
    pub products: Mutex<HashMap<String, String>>,
    pub phase_verbs: Mutex<HashSet<Phase>>,
    pub script_state: Mutex<Option<ScriptState>>,
    pub is_user_managed: Mutex<Option<bool>>,
    pub asset_path: Mutex<Option<PathBuf>>,
    /// The scoped lock for this node's asset cache entry, held from the
    /// first cache-touching phase (`fetch`) through `install`'s commit.
    /// Kept on the node rather than threaded through each handler call
    /// because `fetch`/`stage`/`build`/`install` are separate phase-machine
    /// steps operating on the same attempt (§4.2, §4.7).
    pub asset_lock: Mutex<Option<ScopedLock>>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl RecipeNode {
    pub fn new(spec: Arc<RecipeSpec>) -> Self {
        RecipeNode {
            spec,
            phase: PhaseSync::new(),
            dependencies: Mutex::new(HashMap::new()),
            weak_references: Mutex::new(Vec::new()),
            products: Mutex::new(HashMap::new()),
            phase_verbs: Mutex::new(HashSet::new()),
            script_state: Mutex::new(None),
            is_user_managed: Mutex::new(None),
            asset_path: Mutex::new(None),
            asset_lock: Mutex::new(None),
            executor: Mutex::new(None),
        }
    }

    pub fn canonical_key(&self) -> String {
        self.spec.canonical_key()
    }

    pub fn has_executor(&self) -> bool {
        self.executor.lock().expect("executor mutex poisoned").is_some()
    }

    /// Atomically check-and-spawn: `make_handle` runs (and so a thread is
    /// created) at most once per node, even under concurrent `start_to`
    /// callers. Returns `true` iff this call was the one that spawned it.
    pub fn start_executor_once(self: &Arc<Self>, make_handle: impl FnOnce(Arc<RecipeNode>) -> JoinHandle<()>) -> bool {
        let mut guard = self.executor.lock().expect("executor mutex poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(make_handle(Arc::clone(self)));
        true
    }

    /// Join the node's executor thread, if one was started. Used by the
    /// coordinator once every node has reached a terminal state.
    pub fn join(&self) {
        let handle = self.executor.lock().expect("executor mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn add_product(&self, name: String, value: String) {
        self.products.lock().expect("products mutex poisoned").insert(name, value);
    }

    pub fn record_dependency(&self, key: String, node: Arc<RecipeNode>, needed_by: Phase) {
        self.dependencies
            .lock()
            .expect("dependencies mutex poisoned")
            .insert(key, (node, needed_by));
    }
}

impl std::fmt::Debug for RecipeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeNode")
            .field("key", &self.canonical_key())
            .field("current_phase", &self.phase.current())
            .field("target_phase", &self.phase.target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::options::Options;
    use crate::spec_pool::SourceDescriptor;
    use std::path::PathBuf;

    fn make_node() -> RecipeNode {
        let spec = Arc::new(crate::spec_pool::RecipeSpec {
            identity: Identity::new("local", "tool", "r1"),
            options: Options::new(),
            source: SourceDescriptor::WeakOrReference,
            declaring_file: PathBuf::new(),
            needed_by: None,
            product_name: None,
            declared_dependencies: Vec::new(),
            is_custom_fetch: false,
        });
        RecipeNode::new(spec)
    }

    #[test]
    fn phase_starts_at_recipe_fetch() {
        let node = make_node();
        assert_eq!(node.phase.current(), Phase::RecipeFetch);
        assert_eq!(node.phase.target(), Phase::RecipeFetch);
    }

    #[test]
    fn raise_target_only_moves_forward() {
        let node = make_node();
        node.phase.raise_target(Phase::Build);
        assert_eq!(node.phase.target(), Phase::Build);
        node.phase.raise_target(Phase::Check);
        assert_eq!(node.phase.target(), Phase::Build, "target must never decrease");
    }

    #[test]
    fn wait_until_at_least_unblocks_on_advance() {
        let node = Arc::new(make_node());
        let waiter = Arc::clone(&node);
        let handle = std::thread::spawn(move || waiter.phase.wait_until_at_least(Phase::Fetch));
        std::thread::sleep(std::time::Duration::from_millis(20));
        node.phase.advance_to(Phase::Check);
        node.phase.advance_to(Phase::Fetch);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn failure_unblocks_waiters_with_error() {
        let node = Arc::new(make_node());
        let waiter = Arc::clone(&node);
        let handle = std::thread::spawn(move || waiter.phase.wait_until_at_least(Phase::Completion));
        std::thread::sleep(std::time::Duration::from_millis(20));
        node.phase.fail(Error::ParseError {
            path: PathBuf::new(),
            message: "boom".into(),
        });
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn a_freshly_seeded_node_s_first_phase_to_run_is_recipe_fetch() {
        let node = make_node();
        node.phase.raise_target(Phase::Completion);
        assert_eq!(node.phase.wait_for_next_phase(), Some(Phase::RecipeFetch));
    }

    #[test]
    fn wait_until_at_least_recipe_fetch_blocks_until_it_actually_runs() {
        let node = Arc::new(make_node());
        node.phase.raise_target(Phase::Completion);
        let waiter = Arc::clone(&node);
        let handle = std::thread::spawn(move || waiter.phase.wait_until_at_least(Phase::RecipeFetch));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished(), "recipe_fetch has not run yet, so the wait must still be blocked");
        node.phase.advance_to(Phase::RecipeFetch);
        assert!(handle.join().unwrap().is_ok());
    }
}
