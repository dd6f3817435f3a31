// src/main.rs

use clap::Parser;
use envy::cli::{Cli, Commands};
use envy::config::EngineConfig;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Install {
            manifests,
            cache_root,
            platform,
            arch,
        }) => {
            let config = EngineConfig::new(
                cache_root.unwrap_or_else(EngineConfig::default_cache_root),
                platform.unwrap_or_else(|| EngineConfig::host_platform().to_string()),
                arch.unwrap_or_else(|| EngineConfig::host_arch().to_string()),
            );

            info!(cache_root = %config.cache_root.display(), "resolving manifests");

            match envy::resolve_and_install(config, &manifests) {
                Ok(summary) => {
                    for entry in &summary.installed {
                        match &entry.published_path {
                            Some(path) => println!("{}  ->  {}", entry.canonical_key, path.display()),
                            None => println!("{}  ->  (user-managed)", entry.canonical_key),
                        }
                    }
                    println!("{} package(s) installed", summary.installed.len());
                    Ok(())
                }
                Err(bundle) => {
                    error!("{bundle}");
                    Err(anyhow::anyhow!("{bundle}"))
                }
            }
        }
        Some(Commands::Status {
            manifests,
            cache_root,
            platform,
            arch,
        }) => {
            let config = EngineConfig::new(
                cache_root.unwrap_or_else(EngineConfig::default_cache_root),
                platform.unwrap_or_else(|| EngineConfig::host_platform().to_string()),
                arch.unwrap_or_else(|| EngineConfig::host_arch().to_string()),
            );

            info!(cache_root = %config.cache_root.display(), "resolving manifests for status");

            match envy::resolve_and_install(config, &manifests) {
                Ok(summary) => {
                    for entry in &summary.installed {
                        match &entry.published_path {
                            Some(path) => println!("{}  [{}]  ->  {}", entry.canonical_key, entry.current_phase, path.display()),
                            None => println!("{}  [{}]  ->  (user-managed)", entry.canonical_key, entry.current_phase),
                        }
                    }
                    Ok(())
                }
                Err(bundle) => {
                    error!("{bundle}");
                    Err(anyhow::anyhow!("{bundle}"))
                }
            }
        }
        Some(Commands::Gc { cache_root }) => {
            let cache_root = cache_root.unwrap_or_else(EngineConfig::default_cache_root);
            // gc walks every platform/arch variant under each asset key regardless
            // of what it's constructed with, so the host's own platform/arch is a
            // placeholder here, not a filter.
            let store = envy::cache::CacheStore::new(&cache_root, EngineConfig::host_platform(), EngineConfig::host_arch())?;
            let report = store.gc()?;
            for name in &report.removed_asset_entries {
                println!("removed incomplete asset entry: {name}");
            }
            for name in &report.removed_locks {
                println!("removed stale lock: {name}");
            }
            println!(
                "{} asset entr{} removed, {} lock{} removed",
                report.removed_asset_entries.len(),
                if report.removed_asset_entries.len() == 1 { "y" } else { "ies" },
                report.removed_locks.len(),
                if report.removed_locks.len() == 1 { "" } else { "s" }
            );
            Ok(())
        }
        None => {
            println!("envy {}", env!("CARGO_PKG_VERSION"));
            println!("Run 'envy --help' for usage information");
            Ok(())
        }
    }
}
