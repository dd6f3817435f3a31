// src/cli.rs
//! CLI definitions for the `envy` binary.
//!
//! The CLI surface itself is out of scope for this spec (§1: "specified
//! only at the interface level"); this is the thinnest front end that
//! drives the one real entry point, `resolve_and_install` (§6).
//!
//! Grounded on `src/cli.rs`'s `Parser`/`Subcommand` shape, pared down to the
//! single operation this engine actually exposes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "envy")]
#[command(author, version, about = "Project-local toolchain/package provisioner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve and install every recipe declared by one or more manifests
    Install {
        /// Manifest TOML files declaring root recipes
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        /// Cache root directory (default: platform cache dir / envy)
        #[arg(long)]
        cache_root: Option<PathBuf>,

        /// Target platform (default: host platform)
        #[arg(long)]
        platform: Option<String>,

        /// Target architecture (default: host arch)
        #[arg(long)]
        arch: Option<String>,
    },

    /// Resolve every recipe declared by one or more manifests and report
    /// each node's canonical key, phase, and published path, without
    /// printing the "installed" summary `install` does
    Status {
        /// Manifest TOML files declaring root recipes
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        #[arg(long)]
        cache_root: Option<PathBuf>,

        #[arg(long)]
        platform: Option<String>,

        #[arg(long)]
        arch: Option<String>,
    },

    /// Remove asset cache entries that never reached `envy-complete` and
    /// stale lock files nothing currently holds
    Gc {
        /// Cache root directory (default: platform cache dir / envy)
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
}
