//! prefix-kv-cache server binary.
//!
//! Runs the cache service with its transfer lane and exposes it over HTTP.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use prefix_kv_cache::config::{Cli, Config};
use prefix_kv_cache::metrics::exporter::CacheMetrics;
use prefix_kv_cache::scheduler::service::CacheService;
use prefix_kv_cache::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "prefix_kv_cache=debug,tower_http=debug"
    } else {
        "prefix_kv_cache=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("prefix-kv-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        strategy = %config.cache.eviction_policy,
        demote_on_evict = config.cache.demote_on_evict,
        device_slots = config.pool.device_slots,
        host_slots = config.pool.host_slots,
        slot_bytes = config.pool.slot_bytes,
        "Configuration loaded"
    );
    info!(
        prefetch = config.prefetch.enabled,
        tick_ms = config.prefetch.tick_interval_ms,
        max_in_flight = config.prefetch.max_in_flight,
        timeseries = config.timeseries.enabled,
        "Scheduler settings"
    );

    // Start the cache service and its transfer lane.
    let metrics = Arc::new(CacheMetrics::new()?);
    let cache = CacheService::spawn(&config, metrics.clone());

    let state = Arc::new(AppState {
        cache,
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
