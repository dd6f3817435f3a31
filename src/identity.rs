// src/identity.rs
//! Recipe identity: `namespace.name@revision`, and the partial-identity
//! queries used by weak/reference-only dependency matching (§4.1).

use std::fmt;

use crate::error::{Error, Result};

/// A fully-specified recipe identity. Revisions are opaque and compared only
/// for equality — there is no ordering or range semantics (Non-goal: no
/// version-range solving).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
    pub revision: String,
}

impl Identity {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            revision: revision.into(),
        }
    }

    /// Parse a fully-specified identity. Unlike `IdentityQuery::parse`, all
    /// three components are mandatory here; this is used wherever spec.md
    /// requires a concrete identity rather than a query (declared `IDENTITY`
    /// globals, strong dependency specs).
    pub fn parse(s: &str) -> Result<Self> {
        let query = IdentityQuery::parse(s)?;
        let namespace = query.namespace.ok_or_else(|| Error::ParseError {
            path: std::path::PathBuf::new(),
            message: format!("identity '{s}' is missing a namespace"),
        })?;
        let name = query.name.ok_or_else(|| Error::ParseError {
            path: std::path::PathBuf::new(),
            message: format!("identity '{s}' is missing a name"),
        })?;
        let revision = query.revision.ok_or_else(|| Error::ParseError {
            path: std::path::PathBuf::new(),
            message: format!("identity '{s}' is missing a revision"),
        })?;
        Ok(Identity {
            namespace,
            name,
            revision,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.namespace, self.name, self.revision)
    }
}

/// A partial identity used for weak/reference-only/product-constraint
/// matching. Any component may be absent, meaning "wildcard" in `matches`.
///
/// Accepted textual forms: `"name"`, `"ns.name"`, `"name@rev"`,
/// `"ns.name@rev"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityQuery {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub revision: Option<String>,
}

impl IdentityQuery {
    pub fn parse(s: &str) -> Result<Self> {
        let (ns_name, revision) = match s.split_once('@') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };

        if let Some(rev) = revision {
            if rev.is_empty() {
                return Err(Error::ParseError {
                    path: std::path::PathBuf::new(),
                    message: format!("identity '{s}' has an empty revision after '@'"),
                });
            }
        }

        let (namespace, name) = match ns_name.split_once('.') {
            Some((a, b)) => (Some(a), b),
            None => (None, ns_name),
        };

        if name.is_empty() {
            return Err(Error::ParseError {
                path: std::path::PathBuf::new(),
                message: format!("identity '{s}' is missing a name segment"),
            });
        }

        Ok(IdentityQuery {
            namespace: namespace.map(|s| s.to_string()),
            name: Some(name.to_string()),
            revision: revision.map(|s| s.to_string()),
        })
    }

    pub fn from_identity(identity: &Identity) -> Self {
        IdentityQuery {
            namespace: Some(identity.namespace.clone()),
            name: Some(identity.name.clone()),
            revision: Some(identity.revision.clone()),
        }
    }
}

impl fmt::Display for IdentityQuery {
    /// Reconstructs one of the four accepted textual forms, for diagnostics
    /// (§4.6: "missing/ambiguous-reference messages include the query").
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}.")?;
        }
        write!(f, "{}", self.name.as_deref().unwrap_or("?"))?;
        if let Some(rev) = &self.revision {
            write!(f, "@{rev}")?;
        }
        Ok(())
    }
}

/// Partial-identity predicate: every present component of `query` must equal
/// the corresponding component of `candidate`. Options are never consulted —
/// matching is identity-only (§4.1).
pub fn matches(query: &IdentityQuery, candidate: &Identity) -> bool {
    query
        .namespace
        .as_deref()
        .is_none_or(|ns| ns == candidate.namespace)
        && query.name.as_deref().is_none_or(|n| n == candidate.name)
        && query
            .revision
            .as_deref()
            .is_none_or(|r| r == candidate.revision)
}

/// Engine-wide search over a node set's identities, used only during weak
/// resolution (§4.1, §4.6).
pub fn find_candidates<'a, I>(query: &IdentityQuery, identities: I) -> Vec<&'a Identity>
where
    I: IntoIterator<Item = &'a Identity>,
{
    identities
        .into_iter()
        .filter(|candidate| matches(query, candidate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_identity() {
        let id = Identity::parse("local.tool@r1").unwrap();
        assert_eq!(id.namespace, "local");
        assert_eq!(id.name, "tool");
        assert_eq!(id.revision, "r1");
        assert_eq!(id.to_string(), "local.tool@r1");
    }

    #[test]
    fn rejects_missing_namespace_in_full_parse() {
        assert!(Identity::parse("tool@r1").is_err());
    }

    #[test]
    fn query_accepts_all_four_forms() {
        assert_eq!(
            IdentityQuery::parse("name").unwrap(),
            IdentityQuery {
                namespace: None,
                name: Some("name".into()),
                revision: None
            }
        );
        assert_eq!(
            IdentityQuery::parse("ns.name").unwrap(),
            IdentityQuery {
                namespace: Some("ns".into()),
                name: Some("name".into()),
                revision: None
            }
        );
        assert_eq!(
            IdentityQuery::parse("name@rev").unwrap(),
            IdentityQuery {
                namespace: None,
                name: Some("name".into()),
                revision: Some("rev".into())
            }
        );
        assert_eq!(
            IdentityQuery::parse("ns.name@rev").unwrap(),
            IdentityQuery {
                namespace: Some("ns".into()),
                name: Some("name".into()),
                revision: Some("rev".into())
            }
        );
    }

    #[test]
    fn matching_ignores_absent_query_components() {
        let candidate = Identity::new("local", "helper", "r1");
        let query = IdentityQuery::parse("helper").unwrap();
        assert!(matches(&query, &candidate));

        let query_wrong_ns = IdentityQuery::parse("other.helper").unwrap();
        assert!(!matches(&query_wrong_ns, &candidate));
    }

    #[test]
    fn find_candidates_filters_by_query() {
        let a = Identity::new("local", "helper", "r1");
        let b = Identity::new("local", "helper", "r2");
        let c = Identity::new("local", "other", "r1");
        let query = IdentityQuery::parse("local.helper").unwrap();
        let found = find_candidates(&query, [&a, &b, &c]);
        assert_eq!(found.len(), 2);
    }
}
