//! Prometheus exporter for cache gauges and counters.
//!
//! The service updates the metrics from a [`CacheSnapshot`] after every tick;
//! the HTTP layer renders them in the text exposition format.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

use crate::cache::prefetcher::PrefetchStats;
use crate::metrics::timeseries::CacheSnapshot;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Registered cache metrics. Cheap to share behind an `Arc`.
pub struct CacheMetrics {
    registry: Registry,

    total_tokens: IntGauge,
    evictable_tokens: IntGauge,
    protected_tokens: IntGauge,
    host_tokens: IntGauge,
    node_count: IntGauge,
    utilization: Gauge,
    hit_rate: Gauge,
    prefetch_in_flight: IntGauge,

    requests: IntCounter,
    hit_tokens: IntCounter,
    requested_tokens: IntCounter,
    prefetch_committed: IntCounter,
    prefetch_failed: IntCounter,
    evicted_slots: IntCounter,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Advance a counter to an absolute cumulative value.
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl CacheMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let utilization = Gauge::new("kv_cache_utilization", "Device slot utilization (0-1)")?;
        registry.register(Box::new(utilization.clone()))?;
        let hit_rate = Gauge::new("kv_cache_hit_rate", "Cumulative token hit rate (0-1)")?;
        registry.register(Box::new(hit_rate.clone()))?;

        Ok(Self {
            total_tokens: int_gauge(&registry, "kv_cache_total_tokens", "Device-resident tokens")?,
            evictable_tokens: int_gauge(
                &registry,
                "kv_cache_evictable_tokens",
                "Device-resident tokens in unlocked nodes",
            )?,
            protected_tokens: int_gauge(
                &registry,
                "kv_cache_protected_tokens",
                "Device-resident tokens in locked nodes",
            )?,
            host_tokens: int_gauge(&registry, "kv_cache_host_tokens", "Tokens with a host copy")?,
            node_count: int_gauge(&registry, "kv_cache_nodes", "Nodes in the prefix tree")?,
            prefetch_in_flight: int_gauge(
                &registry,
                "kv_cache_prefetch_in_flight",
                "Host-to-device transfers in flight",
            )?,
            requests: counter(&registry, "kv_cache_requests_total", "Prefix match requests")?,
            hit_tokens: counter(&registry, "kv_cache_hit_tokens_total", "Tokens served from cache")?,
            requested_tokens: counter(
                &registry,
                "kv_cache_requested_tokens_total",
                "Tokens requested",
            )?,
            prefetch_committed: counter(
                &registry,
                "kv_cache_prefetch_committed_total",
                "Prefetches committed to device",
            )?,
            prefetch_failed: counter(
                &registry,
                "kv_cache_prefetch_failed_total",
                "Prefetch transfers that failed",
            )?,
            evicted_slots: counter(
                &registry,
                "kv_cache_evicted_slots_total",
                "Device slots reclaimed by eviction",
            )?,
            utilization,
            hit_rate,
            registry,
        })
    }

    /// Update every metric from a snapshot and the prefetch counters.
    pub fn observe(&self, snapshot: &CacheSnapshot, prefetch: &PrefetchStats, in_flight: usize) {
        self.total_tokens.set(snapshot.total_tokens as i64);
        self.evictable_tokens.set(snapshot.evictable_tokens as i64);
        self.protected_tokens.set(snapshot.protected_tokens as i64);
        self.host_tokens.set(snapshot.host_tokens as i64);
        self.node_count.set(snapshot.node_count as i64);
        self.utilization.set(snapshot.utilization);
        self.hit_rate.set(snapshot.hit_rate());
        self.prefetch_in_flight.set(in_flight as i64);

        advance(&self.requests, snapshot.request_count);
        advance(&self.hit_tokens, snapshot.hit_tokens);
        advance(&self.requested_tokens, snapshot.requested_tokens);
        advance(&self.prefetch_committed, prefetch.committed);
        advance(&self.prefetch_failed, prefetch.failed);
    }

    pub fn record_eviction(&self, slots: usize) {
        self.evicted_slots.inc_by(slots as u64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
