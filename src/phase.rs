// src/phase.rs
//! The eight-phase linear progression a recipe node moves through (§4.5).

use std::fmt;

/// One step of a node's lifecycle. Ordering is the phase's numeric value;
/// `current_phase`/`target_phase` on a node are monotonically non-decreasing
/// over this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    RecipeFetch = 0,
    Check = 1,
    Fetch = 2,
    Stage = 3,
    Build = 4,
    Install = 5,
    Deploy = 6,
    Completion = 7,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::RecipeFetch,
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
        Phase::Deploy,
        Phase::Completion,
    ];

    /// Default `needed_by` when a dependency declaration omits it: the intent
    /// is "fully installed before I begin fetching sources" (§4.5, §9).
    pub const DEFAULT_NEEDED_BY: Phase = Phase::Fetch;

    pub fn from_u8(v: u8) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| *p as u8 == v)
    }

    pub fn next(self) -> Option<Phase> {
        Phase::from_u8(self as u8 + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::RecipeFetch => "recipe_fetch",
            Phase::Check => "check",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Deploy => "deploy",
            Phase::Completion => "completion",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
