//! # Ruleset Cache Server Entry Point
//!
//! Opens the rule store, builds the shared ruleset cache and keeps the
//! configured projects warm until interrupted.
//!
//! Usage:
//!   ruleset-server [config.toml]
//!
//! The config path may also be given in `RULESET_CONFIG`. Log verbosity is
//! controlled by `RUST_LOG` (default `info`).

use rulecache::config::Config;
use rulecache::{RefreshScheduler, RulesetCache, SqliteRuleStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const ENV_CONFIG_PATH: &str = "RULESET_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=================================================");
    println!("  Ruleset Cache - Failure Association Rules     ");
    println!("=================================================");
    println!();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_CONFIG_PATH).ok())
        .map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    println!("Opening rule store...");
    let clock = Arc::new(SystemClock);
    let store = match SqliteRuleStore::open(&config.store.database_path, clock.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!(
                "✗ Failed to open rule store at {}: {}",
                config.store.database_path.display(),
                e
            );
            return Err(e.into());
        }
    };
    println!("✓ Rule store opened");
    println!("  - Database: {}", config.store.database_path.display());
    println!();

    let cache = Arc::new(RulesetCache::new(store, clock, &config.cache));
    println!("Ruleset Cache:");
    println!("  - Refresh interval: {}s", cache.refresh_interval().as_secs());
    match config.cache.read_timeout() {
        Some(timeout) => println!("  - Read timeout: {}s", timeout.as_secs()),
        None => println!("  - Read timeout: none"),
    }
    println!("  - Coalesce refreshes: {}", config.cache.coalesce_refreshes);
    println!();

    println!("Warm-up Scheduler:");
    println!("  - Enabled: {}", config.scheduler.enabled);
    println!("  - Interval: {}s", config.scheduler.warm_interval_secs);
    println!("  - Projects: {}", config.scheduler.projects.join(", "));
    println!();

    let scheduler = Arc::new(
        RefreshScheduler::new(Arc::clone(&cache), config.scheduler.clone())
            .with_read_timeout(config.cache.read_timeout()),
    );
    let shutdown = CancellationToken::new();
    let warmup = tokio::spawn(scheduler.start(shutdown.child_token()));

    println!("Running; press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    if let Err(e) = warmup.await {
        eprintln!("✗ Warm-up task ended abnormally: {}", e);
    }

    for project in cache.projects() {
        if let Some(ruleset) = cache.peek(&project) {
            println!(
                "  - {:<25} (Version: {}, Rules: {})",
                project,
                ruleset.rules_version(),
                ruleset.len()
            );
        }
    }

    println!("=================================================");
    println!("  Ruleset Cache Shut Down");
    println!("=================================================");

    Ok(())
}
