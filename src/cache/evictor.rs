//! Eviction policy: ranks reclaimable nodes under memory pressure.
//!
//! A strategy maps a node's metadata to a comparable [`EvictionKey`]. Lower
//! keys are evicted first. Strategies are stateless and only read metadata,
//! so the same strategy value can rank nodes from any number of passes.
//!
//! | Strategy | Key | Evicted first |
//! |---|---|---|
//! | LRU | `last_access_time` | oldest access |
//! | LFU | `(hit_count, last_access_time)` | fewest hits, then oldest |
//! | FIFO | `creation_time` | oldest created |
//! | MRU | `-last_access_time` | most recently used |
//! | FILO | `-creation_time` | most recently created |
//! | Priority | `(priority, last_access_time)` | lowest priority, then oldest |
//! | Steps | `-workflow_eviction_value` | farthest from use, unknown first |
//! | LMU | subtree device tokens | smallest footprint |

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::cache::node::{NodeId, TreeNode};

/// Key used when a node has no workflow prediction. Sorts below any real key.
pub const UNKNOWN_STEPS_SENTINEL: i64 = -9_999_999;

/// The ranking rule used to pick eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum EvictionStrategy {
    #[default]
    #[serde(rename = "lru")]
    #[value(name = "lru")]
    Lru,
    #[serde(rename = "lfu")]
    #[value(name = "lfu")]
    Lfu,
    #[serde(rename = "fifo")]
    #[value(name = "fifo")]
    Fifo,
    #[serde(rename = "mru")]
    #[value(name = "mru")]
    Mru,
    #[serde(rename = "filo")]
    #[value(name = "filo")]
    Filo,
    #[serde(rename = "priority")]
    #[value(name = "priority")]
    Priority,
    /// Workflow-aware: prefixes not needed soon are evicted first.
    #[serde(rename = "steps")]
    #[value(name = "steps")]
    StepsToExecution,
    /// Prefixes with the smallest resident footprint (cheapest to recompute) go first.
    #[serde(rename = "lmu")]
    #[value(name = "lmu")]
    LeastMemoryUsage,
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Lfu => "lfu",
            EvictionStrategy::Fifo => "fifo",
            EvictionStrategy::Mru => "mru",
            EvictionStrategy::Filo => "filo",
            EvictionStrategy::Priority => "priority",
            EvictionStrategy::StepsToExecution => "steps",
            EvictionStrategy::LeastMemoryUsage => "lmu",
        };
        f.write_str(name)
    }
}

/// Comparable eviction rank. Compared lexicographically, lower first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvictionKey {
    pub primary: i64,
    pub secondary: i64,
}

impl EvictionKey {
    pub fn new(primary: i64, secondary: i64) -> Self {
        Self { primary, secondary }
    }

    pub fn single(primary: i64) -> Self {
        Self::new(primary, 0)
    }
}

impl EvictionStrategy {
    /// Rank `node`. `subtree_tokens` is the device footprint of the node's
    /// subtree and is only read by [`EvictionStrategy::LeastMemoryUsage`].
    pub fn priority(&self, node: &TreeNode, subtree_tokens: usize) -> EvictionKey {
        let meta = node.metadata();
        let last_access = meta.last_access_time as i64;
        let created = meta.creation_time as i64;

        match self {
            EvictionStrategy::Lru => EvictionKey::single(last_access),
            EvictionStrategy::Lfu => EvictionKey::new(meta.hit_count as i64, last_access),
            EvictionStrategy::Fifo => EvictionKey::single(created),
            EvictionStrategy::Mru => EvictionKey::single(-last_access),
            EvictionStrategy::Filo => EvictionKey::single(-created),
            EvictionStrategy::Priority => EvictionKey::new(meta.priority, last_access),
            EvictionStrategy::StepsToExecution => match meta.workflow_eviction_value {
                Some(steps) => EvictionKey::single(-steps),
                None => EvictionKey::single(UNKNOWN_STEPS_SENTINEL),
            },
            EvictionStrategy::LeastMemoryUsage => EvictionKey::single(subtree_tokens as i64),
        }
    }

    /// Whether ranking needs the subtree footprint, which costs a traversal.
    pub fn needs_footprint(&self) -> bool {
        matches!(self, EvictionStrategy::LeastMemoryUsage)
    }
}

/// An eviction candidate with its computed key.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub node: NodeId,
    pub key: EvictionKey,
    /// Tie-break: creation tick of the node, older first.
    pub order: u64,
}

impl EvictionCandidate {
    fn rank(&self) -> (EvictionKey, u64, u32) {
        (self.key, self.order, self.node.index())
    }
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the lowest key (first victim).
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

/// Min-ordered queue of eviction candidates.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<EvictionCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: EvictionCandidate) {
        self.heap.push(candidate);
    }

    /// Next victim, lowest key first.
    pub fn pop(&mut self) -> Option<EvictionCandidate> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
