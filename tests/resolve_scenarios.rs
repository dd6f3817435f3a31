// tests/resolve_scenarios.rs

//! End-to-end resolve-and-install scenarios, covering the worked examples
//! in spec.md §8: a strong chain, cycle rejection, weak-fallback
//! convergence, product collision, and the CHECK early-exit.
//!
//! Every recipe here is a local `.lua` file with no network-reachable
//! source, so these tests exercise the full engine (manifest parsing,
//! script adapter, graph wiring, scheduler, cache) without a live server.

use std::fs;
use std::path::{Path, PathBuf};

use envy::config::EngineConfig;
use envy::error::Error;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path().join("cache"), "linux", "x86_64")
}

#[test]
fn scenario_a_strong_chain_installs_and_publishes_a_product() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "tool.lua",
        r#"
        IDENTITY = "local.tool@r1";
        PRODUCTS = #{ bin: "bin/tool" };
        INSTALL = "mkdir -p bin && touch bin/tool";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.tool@r1"
        source = { local = "./tool.lua" }
        "#,
    );

    let summary = envy::resolve_and_install(config(&dir), &[manifest]).expect("resolution should succeed");
    assert_eq!(summary.installed.len(), 1);

    let entry = &summary.installed[0];
    assert_eq!(entry.canonical_key, "local.tool@r1");
    let published = entry.published_path.as_ref().expect("cache-managed node publishes a path");
    assert!(published.join("bin/tool").exists());
    assert!(published.parent().unwrap().join("envy-complete").exists());
    assert!(published.parent().unwrap().join("envy-fingerprint.blake3").exists());
}

#[test]
fn scenario_a_second_run_is_a_cache_hit_and_does_not_rebuild() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "tool.lua",
        r#"
        IDENTITY = "local.tool@r1";
        INSTALL = "mkdir -p bin && touch bin/tool";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.tool@r1"
        source = { local = "./tool.lua" }
        "#,
    );

    let cfg = config(&dir);
    let first = envy::resolve_and_install(cfg.clone(), &[manifest.clone()]).unwrap();
    let published = first.installed[0].published_path.clone().unwrap();
    let marker = published.join("bin/tool");
    let first_mtime = fs::metadata(&marker).unwrap().modified().unwrap();

    let second = envy::resolve_and_install(cfg, &[manifest]).unwrap();
    let second_published = second.installed[0].published_path.clone().unwrap();
    assert_eq!(published, second_published);
    let second_mtime = fs::metadata(&marker).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime, "the fast path must never rebuild a complete entry");
}

#[test]
fn scenario_b_mutual_strong_dependency_is_rejected_as_a_cycle() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "a.lua",
        r#"
        IDENTITY = "local.a@r1";
        DEPENDENCIES = [
            #{ identity: "local.b@r1", source: #{ local: "./b.lua" } }
        ];
        INSTALL = "true";
        "#,
    );
    write(
        dir.path(),
        "b.lua",
        r#"
        IDENTITY = "local.b@r1";
        DEPENDENCIES = [
            #{ identity: "local.a@r1", source: #{ local: "./a.lua" } }
        ];
        INSTALL = "true";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.a@r1"
        source = { local = "./a.lua" }
        "#,
    );

    let err = envy::resolve_and_install(config(&dir), &[manifest]).expect_err("a mutual strong dependency is a cycle");
    assert!(
        err.errors.iter().any(|e| matches!(e, Error::Cycle { path } if path.contains(&"local.a@r1".to_string()) && path.contains(&"local.b@r1".to_string()))),
        "expected a Cycle error naming both identities, got: {err}"
    );

    let cache_root = dir.path().join("cache");
    assert!(
        !cache_root.join("assets/local.a@r1").exists() && !cache_root.join("assets/local.b@r1").exists(),
        "no asset entries should be created when resolution fails before install"
    );
}

#[test]
fn scenario_c_weak_reference_spawns_its_fallback_when_nothing_else_provides_it() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "helper.lua",
        r#"
        IDENTITY = "local.helper@r1";
        INSTALL = "true";
        "#,
    );
    write(
        dir.path(),
        "root.lua",
        r#"
        IDENTITY = "local.root@r1";
        DEPENDENCIES = [
            #{ identity: "local.helper", weak: #{ identity: "local.helper@r1", source: #{ local: "./helper.lua" } } }
        ];
        INSTALL = "true";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.root@r1"
        source = { local = "./root.lua" }
        "#,
    );

    let summary = envy::resolve_and_install(config(&dir), &[manifest]).expect("fallback convergence should succeed");
    assert_eq!(summary.installed.len(), 2, "both the root and the spawned fallback must complete");
    assert!(summary.installed.iter().any(|e| e.canonical_key == "local.root@r1"));
    assert!(summary.installed.iter().any(|e| e.canonical_key == "local.helper@r1"));
}

#[test]
fn scenario_c_weak_reference_resolves_to_an_existing_strong_root_without_a_fallback() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "helper.lua",
        r#"
        IDENTITY = "local.helper@r1";
        INSTALL = "true";
        "#,
    );
    write(
        dir.path(),
        "root.lua",
        r#"
        IDENTITY = "local.root@r1";
        DEPENDENCIES = [
            #{ identity: "local.helper", weak: #{ identity: "local.helper@r1", source: #{ local: "./never_used.lua" } } }
        ];
        INSTALL = "true";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.root@r1"
        source = { local = "./root.lua" }

        [[recipe]]
        identity = "local.helper@r1"
        source = { local = "./helper.lua" }
        "#,
    );

    let summary = envy::resolve_and_install(config(&dir), &[manifest]).expect("weak ref should match the strong root");
    assert_eq!(summary.installed.len(), 2, "the weak reference must resolve to the existing root, not spawn its fallback");
}

#[test]
fn scenario_d_two_recipes_declaring_the_same_product_name_collide() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "x.lua",
        r#"
        IDENTITY = "local.x@r1";
        PRODUCTS = #{ foo: "bin/foo" };
        INSTALL = "mkdir -p bin && touch bin/foo";
        "#,
    );
    write(
        dir.path(),
        "y.lua",
        r#"
        IDENTITY = "local.y@r1";
        PRODUCTS = #{ foo: "bin/foo" };
        INSTALL = "mkdir -p bin && touch bin/foo";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.x@r1"
        source = { local = "./x.lua" }

        [[recipe]]
        identity = "local.y@r1"
        source = { local = "./y.lua" }
        "#,
    );

    let err = envy::resolve_and_install(config(&dir), &[manifest]).expect_err("two providers of 'foo' must collide");
    assert!(
        err.errors.iter().any(|e| matches!(e, Error::ProductCollision { name, .. } if name == "foo")),
        "expected a ProductCollision naming 'foo', got: {err}"
    );
}

#[test]
fn scenario_e_a_satisfied_check_skips_install_and_touches_no_cache_directory() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "managed.lua",
        r#"
        IDENTITY = "local.managed@r1";
        fn CHECK(project_root) {
            true
        }
        fn INSTALL(install_dir, stage_dir, fetch_dir, tmp_dir, options) {
        }
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.managed@r1"
        source = { local = "./managed.lua" }
        "#,
    );

    let summary = envy::resolve_and_install(config(&dir), &[manifest]).expect("user-managed check-true should succeed");
    assert_eq!(summary.installed.len(), 1);
    assert!(summary.installed[0].published_path.is_none(), "a user-managed node publishes no asset path");

    let cache_root = dir.path().join("cache");
    assert!(
        !cache_root.join("assets/local.managed@r1").exists(),
        "CHECK's early exit must never create an asset cache entry"
    );
}

#[test]
fn scenario_f_crash_recovery_clears_partial_install_but_reuses_fetch_dir() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "tool.lua",
        r#"
        IDENTITY = "local.crashed@r1";
        FETCH = "test -f payload.txt || printf 'downloaded' > payload.txt";
        INSTALL = "cp ../fetch/payload.txt payload.txt";
        "#,
    );
    let manifest = write(
        dir.path(),
        "manifest.toml",
        r#"
        [[recipe]]
        identity = "local.crashed@r1"
        source = { local = "./tool.lua" }
        "#,
    );

    let cache_root = dir.path().join("cache");
    let store = envy::cache::CacheStore::new(&cache_root, "linux", "x86_64").unwrap();
    let entry_dir = store
        .published_path(envy::cache::EntryKind::Asset, "local.crashed@r1")
        .parent()
        .unwrap()
        .to_path_buf();
    fs::create_dir_all(entry_dir.join("install")).unwrap();
    fs::write(entry_dir.join("install/junk"), b"leftover from a killed process").unwrap();
    fs::create_dir_all(entry_dir.join("fetch")).unwrap();
    fs::write(entry_dir.join("fetch/payload.txt"), b"already-verified").unwrap();

    let summary = envy::resolve_and_install(config(&dir), &[manifest]).expect("crash recovery should still complete");
    let published = summary.installed[0].published_path.clone().unwrap();

    assert!(!entry_dir.join("install").exists(), "install/ must never survive into the published entry");
    assert_eq!(
        fs::read_to_string(published.join("payload.txt")).unwrap(),
        "already-verified",
        "the pre-existing fetch/ content must be reused rather than re-fetched"
    );
    assert!(entry_dir.join("envy-complete").exists());
}
