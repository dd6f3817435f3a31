// src/error.rs
//! Crate-wide error type
//!
//! One variant per error kind in the closed set the resolver and cache are
//! required to distinguish. Every phase/recipe/lock failure eventually
//! becomes one of these.

use std::path::PathBuf;
use thiserror::Error;

use crate::phase::Phase;

#[derive(Error, Debug)]
pub enum Error {
    #[error("identity mismatch: expected '{expected}', script declared '{declared}' ({path})")]
    IdentityMismatch {
        expected: String,
        declared: String,
        path: PathBuf,
    },

    #[error("hash mismatch for {url}: expected sha256 {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("parse error in {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("reference-only dependency '{query}' (declared in {declaring}) has no match")]
    MissingReference { query: String, declaring: String },

    #[error("ambiguous reference '{query}' (declared in {declaring}) matches: {}", candidates.join(", "))]
    AmbiguousReference {
        query: String,
        declaring: String,
        candidates: Vec<String>,
    },

    #[error("product collision: '{name}' is provided by both {first} and {second}")]
    ProductCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("fallback '{fallback}' does not transitively provide product '{product}'")]
    ProductFallbackInvalid { fallback: String, product: String },

    #[error("needed_by phase '{phase}' is not implemented by dependency '{identity}'")]
    NeededByInvalid { phase: String, identity: String },

    #[error("user-managed recipe '{identity}' violated user-managed constraints: {reason}")]
    UserManagedViolation { identity: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("phase '{phase}' failed for '{identity}': {message}")]
    PhaseFailure {
        identity: String,
        phase: Phase,
        message: String,
        script_location: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Aggregated errors returned by a failed resolution run (§7: "the resolver
/// collects errors across nodes ... returns all errors in a bundle").
#[derive(Debug, Default)]
pub struct ErrorBundle {
    pub errors: Vec<Error>,
}

impl ErrorBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn extend(&mut self, other: ErrorBundle) {
        self.errors.extend(other.errors);
    }
}

impl std::fmt::Display for ErrorBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} error(s):", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorBundle {}

impl From<Error> for ErrorBundle {
    fn from(err: Error) -> Self {
        ErrorBundle { errors: vec![err] }
    }
}
