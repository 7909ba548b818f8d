//! Full-tree node statistics for diagnostics snapshots.
//!
//! Linear in the number of nodes. Never called on the request path.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cache::node::Residency;
use crate::cache::radix_tree::PrefixCache;

/// Counts of device-resident nodes by edge length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeHistogram {
    #[serde(rename = "0-100")]
    pub under_100: usize,
    #[serde(rename = "100-500")]
    pub under_500: usize,
    #[serde(rename = "500-1000")]
    pub under_1000: usize,
    #[serde(rename = "1000+")]
    pub over_1000: usize,
}

impl SizeHistogram {
    fn record(&mut self, tokens: usize) {
        match tokens {
            0..=99 => self.under_100 += 1,
            100..=499 => self.under_500 += 1,
            500..=999 => self.under_1000 += 1,
            _ => self.over_1000 += 1,
        }
    }
}

/// Node counts per residency state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResidencyCounts {
    pub device: usize,
    pub host: usize,
    pub prefetching: usize,
    pub cold: usize,
}

/// Summary of the tree shape. Size figures cover device-resident nodes only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub avg_node_tokens: f64,
    pub max_node_tokens: usize,
    pub min_node_tokens: usize,
    pub size_histogram: SizeHistogram,
    /// Depth (root = 0) -> number of device-resident nodes at that depth.
    pub depth_distribution: BTreeMap<usize, usize>,
    pub residency: ResidencyCounts,
    pub locked_nodes: usize,
}

impl PrefixCache {
    /// Walk the whole tree and summarise it.
    pub fn node_stats(&self) -> NodeStats {
        let mut stats = NodeStats::default();
        let mut total_tokens = 0usize;
        let mut min_tokens = usize::MAX;

        let root = self.root();
        let mut stack = vec![(root, 0usize)];

        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            stack.extend(node.children().map(|c| (c, depth + 1)));
            if id == root {
                continue;
            }

            if node.is_leaf() {
                stats.leaf_count += 1;
            }
            if node.lock_count() > 0 {
                stats.locked_nodes += 1;
            }
            match node.residency() {
                Residency::DeviceResident => stats.residency.device += 1,
                Residency::HostResident => stats.residency.host += 1,
                Residency::Prefetching => stats.residency.prefetching += 1,
                Residency::Cold => stats.residency.cold += 1,
            }

            let Some(value) = node.value() else {
                continue;
            };
            let tokens = value.len();
            stats.node_count += 1;
            total_tokens += tokens;
            stats.max_node_tokens = stats.max_node_tokens.max(tokens);
            min_tokens = min_tokens.min(tokens);
            stats.size_histogram.record(tokens);
            *stats.depth_distribution.entry(depth).or_insert(0) += 1;
        }

        if stats.node_count > 0 {
            stats.avg_node_tokens = total_tokens as f64 / stats.node_count as f64;
            stats.min_node_tokens = min_tokens;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::evictor::EvictionStrategy;
    use crate::cache::radix_tree::PrefixCache;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::pool::kv_pool::{KvPool, TieredSlotPool};

    fn cache() -> PrefixCache {
        let (pool, _worker) = TieredSlotPool::new(&PoolConfig {
            device_slots: 2048,
            host_slots: 16,
            slot_bytes: 1,
        });
        PrefixCache::new(
            &CacheConfig {
                eviction_policy: EvictionStrategy::Lru,
                demote_on_evict: false,
            },
            Box::new(pool),
        )
    }

    #[test]
    fn test_empty_tree() {
        let stats = cache().node_stats();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.min_node_tokens, 0);
        assert!(stats.depth_distribution.is_empty());
    }

    #[test]
    fn test_histogram_and_depth() {
        let mut cache = cache();

        let long: Vec<u32> = (0..600).collect();
        let slots = cache.pool_mut().reserve(long.len()).unwrap();
        cache.insert(&long, &slots).unwrap();

        // Branch off after 150 tokens: splits into 150 + 450, adds a 3-token leaf.
        let mut branch: Vec<u32> = (0..150).collect();
        branch.extend([9000, 9001, 9002]);
        let slots = cache.pool_mut().reserve(branch.len()).unwrap();
        let outcome = cache.insert(&branch, &slots).unwrap();
        cache.pool_mut().release(&outcome.duplicate_slots).unwrap();

        let stats = cache.node_stats();
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.leaf_count, 2);
        assert_eq!(stats.max_node_tokens, 450);
        assert_eq!(stats.min_node_tokens, 3);
        assert_eq!(stats.size_histogram.under_100, 1);
        assert_eq!(stats.size_histogram.under_500, 2);
        assert_eq!(stats.depth_distribution.get(&1), Some(&1));
        assert_eq!(stats.depth_distribution.get(&2), Some(&2));
        assert_eq!(stats.residency.device, 3);
        assert!((stats.avg_node_tokens - 201.0).abs() < 1e-9);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["size_histogram"]["100-500"], 2);
    }
}
