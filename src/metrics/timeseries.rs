//! Opt-in cache time series.
//!
//! Keeps a bounded, time-ordered history of cache snapshots. Snapshots are
//! rate limited, so calling [`CacheTimeSeries::take_snapshot`] every
//! scheduler tick is cheap: only one call per interval walks the tree.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::cache::node_stats::NodeStats;
use crate::cache::radix_tree::PrefixCache;
use crate::config::TimeSeriesConfig;

/// Seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Point-in-time cache state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub timestamp: f64,
    pub total_tokens: usize,
    pub evictable_tokens: usize,
    pub protected_tokens: usize,
    pub host_tokens: usize,
    /// Device slot capacity.
    pub pool_size: usize,
    /// `total_tokens / pool_size`.
    pub utilization: f64,
    /// Cumulative tokens served from cache.
    pub hit_tokens: u64,
    pub miss_tokens: u64,
    pub requested_tokens: u64,
    /// Cumulative non-empty matches.
    pub request_count: u64,
    pub node_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_stats: Option<NodeStats>,
}

impl CacheSnapshot {
    /// Read the counters. `with_node_stats` adds a full tree walk.
    pub fn capture(cache: &PrefixCache, timestamp: f64, with_node_stats: bool) -> Self {
        let hits = cache.hit_counters();
        let pool_size = cache.pool().capacity();
        let total_tokens = cache.total_size();
        let utilization = if pool_size > 0 {
            total_tokens as f64 / pool_size as f64
        } else {
            0.0
        };

        Self {
            timestamp,
            total_tokens,
            evictable_tokens: cache.evictable_size(),
            protected_tokens: cache.protected_size(),
            host_tokens: cache.host_size(),
            pool_size,
            utilization,
            hit_tokens: hits.hit_tokens,
            miss_tokens: hits.miss_tokens(),
            requested_tokens: hits.requested_tokens,
            request_count: hits.requests,
            node_count: cache.node_count(),
            node_stats: with_node_stats.then(|| cache.node_stats()),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.requested_tokens == 0 {
            return 0.0;
        }
        self.hit_tokens as f64 / self.requested_tokens as f64
    }
}

/// Rate-limited snapshot history.
#[derive(Debug)]
pub struct CacheTimeSeries {
    interval_secs: f64,
    history_secs: f64,
    snapshots: VecDeque<CacheSnapshot>,
    last_snapshot: Option<f64>,
}

impl CacheTimeSeries {
    pub fn new(config: &TimeSeriesConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
            history_secs: config.history_secs,
            snapshots: VecDeque::new(),
            last_snapshot: None,
        }
    }

    /// Record a snapshot at `now` unless the last one is younger than the
    /// interval. Prunes entries older than the history window.
    pub fn take_snapshot(&mut self, cache: &PrefixCache, now: f64) -> Option<&CacheSnapshot> {
        if let Some(last) = self.last_snapshot {
            if now - last < self.interval_secs {
                return None;
            }
        }
        self.last_snapshot = Some(now);

        self.snapshots.push_back(CacheSnapshot::capture(cache, now, true));

        let cutoff = now - self.history_secs;
        while self.snapshots.front().is_some_and(|s| s.timestamp < cutoff) {
            self.snapshots.pop_front();
        }

        self.snapshots.back()
    }

    pub fn latest(&self) -> Option<&CacheSnapshot> {
        self.snapshots.back()
    }

    /// Snapshots within `window_secs` of `now`, oldest first. `None` returns all.
    pub fn history(&self, window_secs: Option<f64>, now: f64) -> Vec<CacheSnapshot> {
        match window_secs {
            None => self.snapshots.iter().cloned().collect(),
            Some(window) => {
                let cutoff = now - window;
                self.snapshots
                    .iter()
                    .filter(|s| s.timestamp >= cutoff)
                    .cloned()
                    .collect()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
