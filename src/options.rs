// src/options.rs
//! Options mapping and canonicalization (§3).
//!
//! Canonicalization is the sole key used for memoization, cache paths, and
//! trace identity, so it must be a pure function of `(identity, options)`:
//! keys sorted lexicographically, values serialized deterministically.

use std::collections::BTreeMap;
use std::fmt;

use crate::identity::Identity;

/// The small scripted-value union options may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<OptionValue>),
    Map(Options),
}

impl OptionValue {
    /// Deterministic textual form used inside the canonical key.
    fn canonical(&self) -> String {
        match self {
            OptionValue::Str(s) => s.clone(),
            OptionValue::Int(i) => i.to_string(),
            OptionValue::Bool(b) => b.to_string(),
            OptionValue::List(items) => {
                let inner: Vec<String> = items.iter().map(OptionValue::canonical).collect();
                format!("[{}]", inner.join(","))
            }
            OptionValue::Map(opts) => opts.canonical_body(),
        }
    }
}

/// Ordered mapping from string keys to `OptionValue`. Backed by a `BTreeMap`
/// so lexicographic key ordering is structural rather than something each
/// call site has to remember to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(pub BTreeMap<String, OptionValue>);

impl Options {
    pub fn new() -> Self {
        Options(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    /// `k1=v1,k2=v2,...` with keys already in lexicographic order by virtue
    /// of the backing `BTreeMap`.
    fn canonical_body(&self) -> String {
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.canonical()))
            .collect();
        pairs.join(",")
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_body())
    }
}

/// `identity{k1=v1,k2=v2,...}`, braces omitted when options are empty. This
/// string is the sole key for memoization (`ensure_node`), filesystem
/// sub-paths, and trace identity (§3).
pub fn canonical_key(identity: &Identity, options: &Options) -> String {
    if options.is_empty() {
        identity.to_string()
    } else {
        format!("{}{{{}}}", identity, options.canonical_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Identity {
        Identity::new("local", "tool", "r1")
    }

    #[test]
    fn empty_options_omit_braces() {
        assert_eq!(canonical_key(&id(), &Options::new()), "local.tool@r1");
    }

    #[test]
    fn canonicalization_is_independent_of_insertion_order() {
        let mut a = Options::new();
        a.insert("zebra", OptionValue::Bool(true));
        a.insert("alpha", OptionValue::Int(1));

        let mut b = Options::new();
        b.insert("alpha", OptionValue::Int(1));
        b.insert("zebra", OptionValue::Bool(true));

        assert_eq!(canonical_key(&id(), &a), canonical_key(&id(), &b));
        assert_eq!(canonical_key(&id(), &a), "local.tool@r1{alpha=1,zebra=true}");
    }

    #[test]
    fn nested_maps_and_lists_are_serialized() {
        let mut inner = Options::new();
        inner.insert("x", OptionValue::Int(1));
        let mut opts = Options::new();
        opts.insert(
            "list",
            OptionValue::List(vec![OptionValue::Str("a".into()), OptionValue::Str("b".into())]),
        );
        opts.insert("nested", OptionValue::Map(inner));

        assert_eq!(
            canonical_key(&id(), &opts),
            "local.tool@r1{list=[a,b],nested={x=1}}"
        );
    }

    #[test]
    fn distinct_options_produce_distinct_keys() {
        let mut a = Options::new();
        a.insert("k", OptionValue::Int(1));
        let mut b = Options::new();
        b.insert("k", OptionValue::Int(2));
        assert_ne!(canonical_key(&id(), &a), canonical_key(&id(), &b));
    }
}
