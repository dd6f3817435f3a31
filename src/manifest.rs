// src/manifest.rs
//! Manifest-root parsing (§6): the TOML files a caller points `envy` at,
//! each declaring one or more root specs to resolve and install, plus
//! `envy-bundle.lua` parsing for bundle-contained recipes.
//!
//! Grounded on `src/ccs/manifest.rs`'s declarative-table-to-typed-struct
//! shape, using `toml`/`serde` the same way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::options::{OptionValue, Options};
use crate::registry::BundleMeta;
use crate::spec_pool::SourceDescriptor;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default, rename = "recipe")]
    recipes: Vec<RecipeEntry>,
}

#[derive(Debug, Deserialize)]
struct RecipeEntry {
    identity: String,
    #[serde(default)]
    options: toml::value::Table,
    source: SourceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceEntry {
    Remote {
        remote: String,
        sha256: Option<String>,
    },
    Local {
        local: String,
    },
    Git {
        git: String,
        git_ref: String,
    },
}

/// One root spec declared by a manifest file, fully typed and ready to be
/// handed to `SpecPool::insert` (§4.6: "seed manifest roots with
/// `target=completion`").
#[derive(Debug)]
pub struct ManifestRoot {
    pub identity: Identity,
    pub options: Options,
    pub source: SourceDescriptor,
}

/// Parse one manifest TOML file into its declared root specs.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestRoot>> {
    let text = std::fs::read_to_string(path).map_err(Error::Io)?;
    let file: ManifestFile = toml::from_str(&text).map_err(|e| Error::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    file.recipes
        .into_iter()
        .map(|entry| {
            let identity = Identity::parse(&entry.identity).map_err(|_| Error::ParseError {
                path: path.to_path_buf(),
                message: format!("invalid identity '{}'", entry.identity),
            })?;
            let options = toml_table_to_options(&entry.options);
            let source = match entry.source {
                SourceEntry::Remote { remote, sha256 } => SourceDescriptor::Remote { url: remote, sha256 },
                SourceEntry::Local { local } => SourceDescriptor::Local {
                    path: resolve_relative(path, &local),
                },
                SourceEntry::Git { git, git_ref } => SourceDescriptor::Git { url: git, git_ref },
            };
            Ok(ManifestRoot { identity, options, source })
        })
        .collect()
}

fn resolve_relative(manifest_path: &Path, relative: &str) -> PathBuf {
    let candidate = PathBuf::from(relative);
    if candidate.is_absolute() {
        return candidate;
    }
    manifest_path
        .parent()
        .map(|dir| dir.join(&candidate))
        .unwrap_or(candidate)
}

fn toml_table_to_options(table: &toml::value::Table) -> Options {
    let mut options = Options::new();
    for (key, value) in table {
        options.insert(key.clone(), toml_value_to_option_value(value));
    }
    options
}

fn toml_value_to_option_value(value: &toml::Value) -> OptionValue {
    match value {
        toml::Value::String(s) => OptionValue::Str(s.clone()),
        toml::Value::Integer(i) => OptionValue::Int(*i),
        toml::Value::Boolean(b) => OptionValue::Bool(*b),
        toml::Value::Float(f) => OptionValue::Str(f.to_string()),
        toml::Value::Datetime(d) => OptionValue::Str(d.to_string()),
        toml::Value::Array(items) => OptionValue::List(items.iter().map(toml_value_to_option_value).collect()),
        toml::Value::Table(inner) => OptionValue::Map(toml_table_to_options(inner)),
    }
}

/// Parse `envy-bundle.lua`: a bare declaration of `BUNDLE = "identity"` and
/// `SPECS = { "identity" => "relative/path.lua", ... }`, read with a fresh
/// `rhai::Engine` rather than `ScriptAdapter` — a bundle descriptor is
/// static data, not a recipe with phase verbs, so it never needs the
/// sandbox namespace (§6, §9).
pub fn load_bundle(path: &Path) -> Result<BundleMeta> {
    let text = std::fs::read_to_string(path).map_err(Error::Io)?;
    let engine = rhai::Engine::new();
    let mut scope = rhai::Scope::new();
    engine.run_with_scope(&mut scope, &text).map_err(|e| Error::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let identity = scope.get_value::<String>("BUNDLE").ok_or_else(|| Error::ParseError {
        path: path.to_path_buf(),
        message: "bundle descriptor is missing a string BUNDLE global".into(),
    })?;

    let specs_map = scope.get_value::<rhai::Map>("SPECS").ok_or_else(|| Error::ParseError {
        path: path.to_path_buf(),
        message: "bundle descriptor is missing a SPECS table".into(),
    })?;

    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut specs = HashMap::new();
    for (key, value) in specs_map.iter() {
        let relative = value.clone().try_cast::<String>().ok_or_else(|| Error::ParseError {
            path: path.to_path_buf(),
            message: format!("SPECS['{key}'] must be a string path"),
        })?;
        specs.insert(key.to_string(), root.join(relative));
    }

    Ok(BundleMeta { identity, root, specs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn parses_a_local_source_root() {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("manifest.toml");
        let mut f = std::fs::File::create(&manifest_path).unwrap();
        writeln!(
            f,
            r#"
            [[recipe]]
            identity = "local.tool@r1"
            source = {{ local = "./tool.lua" }}
            options = {{ strip = 1, shared = true }}
            "#
        )
        .unwrap();

        let roots = load_manifest(&manifest_path).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].identity.to_string(), "local.tool@r1");
        match &roots[0].source {
            SourceDescriptor::Local { path } => assert!(path.ends_with("tool.lua")),
            other => panic!("expected Local source, got {other:?}"),
        }
        assert_eq!(roots[0].options.get("strip"), Some(&OptionValue::Int(1)));
    }

    #[test]
    fn parses_a_remote_source_root_with_hash() {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("manifest.toml");
        let mut f = std::fs::File::create(&manifest_path).unwrap();
        writeln!(
            f,
            r#"
            [[recipe]]
            identity = "remote.pkg@r2"
            source = {{ remote = "https://example.com/pkg.lua", sha256 = "abc123" }}
            "#
        )
        .unwrap();

        let roots = load_manifest(&manifest_path).unwrap();
        match &roots[0].source {
            SourceDescriptor::Remote { url, sha256 } => {
                assert_eq!(url, "https://example.com/pkg.lua");
                assert_eq!(sha256.as_deref(), Some("abc123"));
            }
            other => panic!("expected Remote source, got {other:?}"),
        }
    }

    #[test]
    fn rejects_an_invalid_identity() {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("manifest.toml");
        let mut f = std::fs::File::create(&manifest_path).unwrap();
        writeln!(
            f,
            r#"
            [[recipe]]
            identity = "no-namespace-or-revision"
            source = {{ local = "./tool.lua" }}
            "#
        )
        .unwrap();

        assert!(load_manifest(&manifest_path).is_err());
    }

    #[test]
    fn parses_a_bundle_descriptor() {
        let dir = TempDir::new().unwrap();
        let bundle_path = dir.path().join("envy-bundle.lua");
        std::fs::write(
            &bundle_path,
            r#"
            BUNDLE = "local.toolchain@r1";
            SPECS = #{ "local.cc@r1": "cc.lua", "local.ld@r1": "ld.lua" };
            "#,
        )
        .unwrap();

        let meta = load_bundle(&bundle_path).unwrap();
        assert_eq!(meta.identity, "local.toolchain@r1");
        assert_eq!(meta.specs.len(), 2);
        assert!(meta.specs.contains_key("local.cc@r1"));
    }
}
