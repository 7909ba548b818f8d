//! Runtime configuration for prefix-kv-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only needs the knobs it changes.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::evictor::EvictionStrategy;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "prefix-kv-cache", about = "Prefix-sharing KV cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Eviction strategy. Overrides `cache.eviction_policy`.
    #[arg(long, value_enum)]
    pub eviction_policy: Option<EvictionStrategy>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub prefetch: PrefetchConfig,
    pub timeseries: TimeSeriesConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Depth of the command queue in front of the cache service.
    pub command_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            command_queue_depth: 256,
        }
    }
}

/// Prefix tree behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub eviction_policy: EvictionStrategy,

    /// Copy evicted device state to the host tier instead of dropping it.
    pub demote_on_evict: bool,
}

/// Slot pool sizing. One slot holds one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub device_slots: usize,
    pub host_slots: usize,

    /// Bytes of KV state per slot in the simulated buffers.
    pub slot_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_slots: 16384,
            host_slots: 65536,
            slot_bytes: 64,
        }
    }
}

/// Prefetch engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Interval between scheduler ticks.
    pub tick_interval_ms: u64,

    /// Maximum transfers in flight (0 = unlimited).
    pub max_in_flight: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 10,
            max_in_flight: 0,
        }
    }
}

/// Cache time-series tracking. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesConfig {
    pub enabled: bool,

    /// Minimum seconds between snapshots.
    pub interval_secs: f64,

    /// Snapshots older than this are pruned.
    pub history_secs: f64,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5.0,
            history_secs: 300.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(policy) = cli.eviction_policy {
            self.cache.eviction_policy = policy;
        }
    }
}
