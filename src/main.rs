//! Warm Cache demo
//!
//! Builds a cache from environment configuration, keeps one key warm through a
//! refresh function and reports its value and statistics until interrupted.
//!
//! Set `CACHE_SNAPSHOT_PATH` to persist snapshots to a JSON file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warm_cache::cache::current_timestamp_ms;
use warm_cache::storage::JsonFileStorage;
use warm_cache::{refresh_fn, CacheConfig, CacheStore};

const DEMO_KEY: &str = "demo:clock";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warm_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env();
    info!(
        "Configuration loaded: name={}, default_expiration={}ms, background_refresh={}, interval={}ms, min_ttl={}ms",
        config.name,
        config.default_expiration_ms(),
        config.background_refresh_enabled,
        config.refresh_interval_ms(),
        config.refresh_min_ttl_ms()
    );

    let mut builder = CacheStore::builder(config);
    if let Ok(path) = std::env::var("CACHE_SNAPSHOT_PATH") {
        info!("Persisting snapshots to {}", path);
        builder = builder.storage(Arc::new(JsonFileStorage::new(path)));
    }
    let cache = builder.build().context("invalid cache configuration")?;

    // Stand-in for a slow backing source
    let loads = Arc::new(AtomicU64::new(0));
    let counter = loads.clone();
    let refresh = refresh_fn(move |key| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let load = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "key": key, "loaded_at": current_timestamp_ms(), "load": load }))
        }
    });

    let initial = json!({ "key": DEMO_KEY, "loaded_at": current_timestamp_ms(), "load": 0 });
    cache
        .set_with_refresh(DEMO_KEY, initial, None, refresh)
        .context("failed to seed demo key")?;

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = report.tick() => {
                match cache.get(DEMO_KEY) {
                    Ok(Some(value)) => info!("{} = {}", DEMO_KEY, value),
                    Ok(None) => warn!("{} is cold", DEMO_KEY),
                    Err(err) => warn!("read failed: {}", err),
                }
                let stats = cache.stats();
                info!(
                    "stats: hits={}, misses={}, refreshes={}, hit_rate={:.2}",
                    stats.hits, stats.misses, stats.refreshes, stats.hit_rate()
                );
            }
            result = signal::ctrl_c() => {
                result.context("failed to install Ctrl+C handler")?;
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    cache.shutdown();
    info!("Shutdown complete after {} background loads", loads.load(Ordering::SeqCst));
    Ok(())
}
