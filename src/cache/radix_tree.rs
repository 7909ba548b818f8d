//! Prefix tree: the cache index.
//!
//! The tree is the central coordinator for cached KV state. It:
//! - Resolves the longest device-resident prefix of a request and locks it
//! - Inserts freshly computed sequences, splitting edges as needed
//! - Evicts unlocked leaves under memory pressure using the configured strategy
//! - Maintains resident/evictable/protected token counters incrementally
//!
//! Nodes live in an arena and are addressed by generational [`NodeId`]s.
//! All mutation goes through `&mut self`; the owner is expected to be a
//! single driving task (see `scheduler::service`).

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::evictor::{CandidateQueue, EvictionCandidate, EvictionStrategy};
use crate::cache::node::{
    common_prefix_len, NodeHints, NodeId, NodeMetadata, TokenId, TreeNode,
};
use crate::config::CacheConfig;
use crate::pool::allocator::{AllocError, MemoryTier, SlotId};
use crate::pool::kv_pool::KvPool;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Capacity exhausted: needed {requested} slots, freed only {freed}")]
    CapacityExhausted { requested: usize, freed: usize },

    #[error("Token/slot length mismatch: {tokens} tokens, {slots} slots")]
    LengthMismatch { tokens: usize, slots: usize },

    #[error("Unknown or stale node {0}")]
    UnknownNode(NodeId),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Log and build an invariant violation.
pub(crate) fn invariant_violation(msg: String) -> CacheError {
    error!(error = %msg, "Cache invariant violation");
    CacheError::InvariantViolation(msg)
}

/// Cumulative prefix-match accounting for hit-rate reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitCounters {
    /// Number of non-empty `match_prefix` calls.
    pub requests: u64,
    /// Tokens served from device-resident cache.
    pub hit_tokens: u64,
    /// Tokens asked for.
    pub requested_tokens: u64,
}

impl HitCounters {
    pub fn miss_tokens(&self) -> u64 {
        self.requested_tokens.saturating_sub(self.hit_tokens)
    }

    pub fn hit_rate(&self) -> f64 {
        if self.requested_tokens == 0 {
            return 0.0;
        }
        self.hit_tokens as f64 / self.requested_tokens as f64
    }
}

/// Result of a prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Device slots of the matched prefix, in token order.
    pub device_indices: Vec<SlotId>,

    /// Locked nodes along the matched path, root excluded, shallowest first.
    /// Pass to [`PrefixCache::unlock`] when the request is done.
    pub matched_nodes: Vec<NodeId>,

    /// Deepest matched node, or the root when nothing matched.
    pub last_node: NodeId,

    /// Tokens not served from device memory.
    pub residual: Vec<TokenId>,

    /// Tokens past the device prefix that have a host copy.
    pub host_hit_len: usize,

    /// Host-resident nodes continuing the match, shallowest first.
    /// Candidates for prefetch.
    pub host_nodes: Vec<NodeId>,
}

impl MatchResult {
    pub fn matched_len(&self) -> usize {
        self.device_indices.len()
    }
}

/// Result of a read-only [`PrefixCache::lookup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixLookup {
    /// Tokens a match would serve from device memory.
    pub device_len: usize,
    /// Tokens past that with a host copy, whole edges only.
    pub host_len: usize,
    pub host_nodes: Vec<NodeId>,
}

/// Result of an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Tokens placed in newly created nodes.
    pub new_tokens: usize,

    /// Tokens that filled existing nodes which had no slots in this tier.
    pub revived_tokens: usize,

    /// Caller slots not adopted by the tree. The caller must release them.
    pub duplicate_slots: Vec<SlotId>,

    /// Deepest node covering the inserted sequence.
    pub last_node: NodeId,
}

impl InsertOutcome {
    /// Tokens that were already cached before the insert.
    pub fn cached_tokens(&self) -> usize {
        self.duplicate_slots.len()
    }
}

#[derive(Debug)]
struct ArenaSlot {
    generation: u32,
    node: Option<TreeNode>,
}

/// The prefix cache.
pub struct PrefixCache {
    arena: Vec<ArenaSlot>,
    free_slots: Vec<u32>,
    root: NodeId,

    pool: Box<dyn KvPool>,
    strategy: EvictionStrategy,
    demote_on_evict: bool,

    /// Logical clock for access/creation times.
    clock: u64,

    total_device_tokens: usize,
    evictable_device_tokens: usize,
    protected_device_tokens: usize,
    host_tokens: usize,

    hits: HitCounters,
}

impl PrefixCache {
    /// Create an empty cache over the given pool.
    pub fn new(config: &CacheConfig, pool: Box<dyn KvPool>) -> Self {
        let arena = vec![ArenaSlot {
            generation: 0,
            node: Some(TreeNode::root()),
        }];

        info!(
            strategy = %config.eviction_policy,
            demote_on_evict = config.demote_on_evict,
            device_slots = pool.capacity(),
            host_slots = pool.host_capacity(),
            "Prefix cache initialized"
        );

        Self {
            arena,
            free_slots: Vec::new(),
            root: NodeId::new(0, 0),
            pool,
            strategy: config.eviction_policy,
            demote_on_evict: config.demote_on_evict,
            clock: 0,
            total_device_tokens: 0,
            evictable_device_tokens: 0,
            protected_device_tokens: 0,
            host_tokens: 0,
            hits: HitCounters::default(),
        }
    }

    // ─── Arena ──────────────────────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Look up a node by handle. Stale handles resolve to `None`.
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        let slot = self.arena.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        let slot = self.arena.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<&TreeNode, CacheError> {
        self.node(id).ok_or(CacheError::UnknownNode(id))
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Result<&mut TreeNode, CacheError> {
        self.node_mut(id).ok_or(CacheError::UnknownNode(id))
    }

    /// Mutable access to eviction metadata. Never affects residency counters.
    pub fn metadata_mut(&mut self, id: NodeId) -> Option<&mut NodeMetadata> {
        self.node_mut(id).map(|n| &mut n.metadata)
    }

    pub fn set_priority(&mut self, id: NodeId, priority: i64) -> Result<(), CacheError> {
        self.get_mut(id)?.metadata.priority = priority;
        Ok(())
    }

    /// Iterate every live node, root included.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> + '_ {
        self.arena.iter().enumerate().filter_map(|(i, slot)| {
            slot.node
                .as_ref()
                .map(|n| (NodeId::new(i as u32, slot.generation), n))
        })
    }

    /// Number of live nodes, root excluded.
    pub fn node_count(&self) -> usize {
        self.arena.len() - self.free_slots.len() - 1
    }

    fn alloc_node(&mut self, node: TreeNode) -> NodeId {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.arena[index as usize];
            slot.node = Some(node);
            NodeId::new(index, slot.generation)
        } else {
            let index = self.arena.len() as u32;
            self.arena.push(ArenaSlot {
                generation: 0,
                node: Some(node),
            });
            NodeId::new(index, 0)
        }
    }

    /// Detach a childless node from its parent and free its arena slot.
    fn remove_node(&mut self, id: NodeId) -> Result<(), CacheError> {
        let node = self.get(id)?;
        if id == self.root || !node.is_leaf() || node.value.is_some() || node.is_prefetching {
            return Err(self.violation(format!("cannot remove node {id}: not a cold leaf")));
        }
        let parent = node.parent;
        let first = node.key.first().copied();
        let host = node.host_tokens();

        if let (Some(parent), Some(first)) = (parent, first) {
            self.get_mut(parent)?.children.remove(&first);
        }
        self.host_tokens = self.host_tokens.saturating_sub(host);

        let slot = &mut self.arena[id.index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index);

        debug!(node = %id, "Removed node");
        Ok(())
    }

    // ─── Pool / clock ───────────────────────────────────────────────────────

    pub fn pool(&self) -> &dyn KvPool {
        self.pool.as_ref()
    }

    pub fn pool_mut(&mut self) -> &mut dyn KvPool {
        self.pool.as_mut()
    }

    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    fn now(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn violation(&self, msg: String) -> CacheError {
        invariant_violation(msg)
    }

    // ─── Counters ───────────────────────────────────────────────────────────

    /// Device-resident tokens.
    pub fn total_size(&self) -> usize {
        self.total_device_tokens
    }

    /// Device-resident tokens in unlocked nodes.
    pub fn evictable_size(&self) -> usize {
        self.evictable_device_tokens
    }

    /// Device-resident tokens in locked nodes.
    pub fn protected_size(&self) -> usize {
        self.protected_device_tokens
    }

    /// Tokens with a host copy.
    pub fn host_size(&self) -> usize {
        self.host_tokens
    }

    pub fn hit_counters(&self) -> HitCounters {
        self.hits
    }

    /// Replace a node's device value, keeping the counters in step.
    pub(crate) fn set_value(
        &mut self,
        id: NodeId,
        value: Option<Vec<SlotId>>,
    ) -> Result<Option<Vec<SlotId>>, CacheError> {
        let node = self.get_mut(id)?;
        let locked = node.lock_count > 0;
        let old = std::mem::replace(&mut node.value, value);
        let added = node.device_tokens();
        let removed = old.as_ref().map_or(0, Vec::len);

        self.total_device_tokens = self.total_device_tokens + added - removed;
        if locked {
            self.protected_device_tokens = self.protected_device_tokens + added - removed;
        } else {
            self.evictable_device_tokens = self.evictable_device_tokens + added - removed;
        }
        Ok(old)
    }

    fn set_host_value(
        &mut self,
        id: NodeId,
        host_value: Option<Vec<SlotId>>,
    ) -> Result<Option<Vec<SlotId>>, CacheError> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.host_value, host_value);
        let added = node.host_tokens();
        let removed = old.as_ref().map_or(0, Vec::len);
        self.host_tokens = self.host_tokens + added - removed;
        Ok(old)
    }

    fn inc_lock(&mut self, id: NodeId) -> Result<(), CacheError> {
        let node = self.get_mut(id)?;
        node.lock_count += 1;
        if node.lock_count == 1 {
            let tokens = node.device_tokens();
            self.evictable_device_tokens -= tokens;
            self.protected_device_tokens += tokens;
        }
        Ok(())
    }

    fn dec_lock(&mut self, id: NodeId) -> Result<(), CacheError> {
        let node = self.get_mut(id)?;
        node.lock_count -= 1;
        if node.lock_count == 0 {
            let tokens = node.device_tokens();
            self.protected_device_tokens -= tokens;
            self.evictable_device_tokens += tokens;
        }
        Ok(())
    }

    /// Ancestors of `id` up to (excluding) the root, deepest first.
    fn path_to_root(&self, id: NodeId) -> Result<Vec<NodeId>, CacheError> {
        let mut path = Vec::new();
        let mut cur = id;
        while cur != self.root {
            path.push(cur);
            cur = self
                .get(cur)?
                .parent
                .ok_or_else(|| self.violation(format!("node {cur} has no parent")))?;
        }
        Ok(path)
    }

    // ─── Match ──────────────────────────────────────────────────────────────

    /// Find the longest device-resident prefix of `tokens` and lock it.
    ///
    /// The walk stops at a missing edge, a node without device slots, or a
    /// node with a prefetch in flight. A partially matching resident edge is
    /// split so the matched part becomes its own node.
    pub fn match_prefix(&mut self, tokens: &[TokenId]) -> Result<MatchResult, CacheError> {
        if tokens.is_empty() {
            return Ok(MatchResult {
                device_indices: Vec::new(),
                matched_nodes: Vec::new(),
                last_node: self.root,
                residual: Vec::new(),
                host_hit_len: 0,
                host_nodes: Vec::new(),
            });
        }

        let now = self.now();
        let mut cur = self.root;
        let mut pos = 0;
        let mut device_indices = Vec::new();
        let mut matched_nodes = Vec::new();

        while pos < tokens.len() {
            let Some(child) = self.get(cur)?.child(tokens[pos]) else {
                break;
            };
            let node = self.get(child)?;
            if node.is_prefetching || node.value.is_none() {
                break;
            }

            let common = common_prefix_len(&node.key, &tokens[pos..]);
            let partial = common < node.key.len();
            let target = if partial {
                self.split_node(child, common)?
            } else {
                child
            };

            let node = self.get_mut(target)?;
            node.touch(now);
            if let Some(value) = &node.value {
                device_indices.extend_from_slice(value);
            }
            matched_nodes.push(target);
            pos += common;
            cur = target;

            if partial {
                break;
            }
        }

        for &id in &matched_nodes {
            self.inc_lock(id)?;
        }

        // Continue read-only through host copies to report prefetchable state.
        let mut host_hit_len = 0;
        let mut host_nodes = Vec::new();
        let mut hcur = cur;
        let mut hpos = pos;
        while hpos < tokens.len() {
            let Some(child) = self.get(hcur)?.child(tokens[hpos]) else {
                break;
            };
            let node = self.get(child)?;
            if node.is_prefetching || node.host_value.is_none() {
                break;
            }
            let common = common_prefix_len(&node.key, &tokens[hpos..]);
            if common < node.key.len() {
                break;
            }
            host_hit_len += common;
            host_nodes.push(child);
            hpos += common;
            hcur = child;
        }

        self.hits.requests += 1;
        self.hits.hit_tokens += pos as u64;
        self.hits.requested_tokens += tokens.len() as u64;

        debug!(
            requested = tokens.len(),
            matched = pos,
            host_hit = host_hit_len,
            nodes = matched_nodes.len(),
            "Prefix match"
        );

        Ok(MatchResult {
            device_indices,
            matched_nodes,
            last_node: cur,
            residual: tokens[pos..].to_vec(),
            host_hit_len,
            host_nodes,
        })
    }

    /// Probe how much of `tokens` is cached without touching the tree:
    /// no locks, no splits, no access times and no hit accounting.
    pub fn lookup(&self, tokens: &[TokenId]) -> PrefixLookup {
        let mut lookup = PrefixLookup::default();
        let mut cur = self.root;
        let mut pos = 0;
        let mut on_device = true;

        while pos < tokens.len() {
            let Some(child) = self.node(cur).and_then(|n| n.child(tokens[pos])) else {
                break;
            };
            let Some(node) = self.node(child) else {
                break;
            };
            if node.is_prefetching {
                break;
            }

            let common = common_prefix_len(&node.key, &tokens[pos..]);
            if on_device && node.value.is_some() {
                lookup.device_len += common;
            } else if node.host_value.is_some() && common == node.key.len() {
                on_device = false;
                lookup.host_len += common;
                lookup.host_nodes.push(child);
            } else {
                break;
            }

            if common < node.key.len() {
                break;
            }
            pos += common;
            cur = child;
        }
        lookup
    }

    /// Release the locks taken by a match.
    ///
    /// Walks up from the deepest node in `matched_nodes` through parent links,
    /// so nodes split off above it since the match are unlocked too.
    pub fn unlock(&mut self, matched_nodes: &[NodeId]) -> Result<(), CacheError> {
        let Some(&last) = matched_nodes.last() else {
            return Ok(());
        };

        let path = self.path_to_root(last)?;
        for &id in &path {
            if self.get(id)?.lock_count == 0 {
                return Err(self.violation(format!("unlock of unlocked node {id}")));
            }
        }
        for &id in &path {
            self.dec_lock(id)?;
        }
        Ok(())
    }

    /// Split `id` after `at` tokens. Returns the new upper node, which takes
    /// the prefix and becomes the parent of `id`.
    ///
    /// ```text
    /// Before: parent -> id([1,2,3,4,5])
    /// After:  parent -> upper([1,2,3]) -> id([4,5])
    /// ```
    fn split_node(&mut self, id: NodeId, at: usize) -> Result<NodeId, CacheError> {
        let root = self.root;
        let node = self.get_mut(id)?;
        if at == 0 || at >= node.key.len() || node.is_prefetching {
            let len = node.key.len();
            return Err(self.violation(format!("invalid split of node {id} at {at} (len {len})")));
        }

        let parent = node.parent.unwrap_or(root);
        let upper_key: Vec<TokenId> = node.key.drain(..at).collect();
        let upper_value = node.value.as_mut().map(|v| v.drain(..at).collect::<Vec<_>>());
        let upper_host = node
            .host_value
            .as_mut()
            .map(|v| v.drain(..at).collect::<Vec<_>>());
        let lower_first = node.key[0];
        let lock_count = node.lock_count;
        let metadata = node.metadata.clone();

        let mut upper = TreeNode::new(upper_key, parent, metadata);
        upper.value = upper_value;
        upper.host_value = upper_host;
        upper.lock_count = lock_count;
        upper.children.insert(lower_first, id);
        let upper_first = upper.key[0];

        let upper_id = self.alloc_node(upper);
        self.get_mut(id)?.parent = Some(upper_id);
        self.get_mut(parent)?.children.insert(upper_first, upper_id);

        debug!(node = %id, upper = %upper_id, at, "Split node");
        Ok(upper_id)
    }

    // ─── Insert ─────────────────────────────────────────────────────────────

    /// Insert a computed sequence with its device slots.
    pub fn insert(
        &mut self,
        tokens: &[TokenId],
        device_indices: &[SlotId],
    ) -> Result<InsertOutcome, CacheError> {
        self.insert_with(tokens, device_indices, NodeHints::default())
    }

    /// Insert with eviction hints for the nodes this call creates.
    pub fn insert_with(
        &mut self,
        tokens: &[TokenId],
        device_indices: &[SlotId],
        hints: NodeHints,
    ) -> Result<InsertOutcome, CacheError> {
        self.insert_tier(tokens, device_indices, &hints, MemoryTier::Device)
    }

    /// Register a host-resident sequence (e.g. restored state) with its host slots.
    pub fn insert_host(
        &mut self,
        tokens: &[TokenId],
        host_indices: &[SlotId],
    ) -> Result<InsertOutcome, CacheError> {
        self.insert_tier(tokens, host_indices, &NodeHints::default(), MemoryTier::Host)
    }

    fn tier_value(node: &TreeNode, tier: MemoryTier) -> Option<&Vec<SlotId>> {
        match tier {
            MemoryTier::Device => node.value.as_ref(),
            MemoryTier::Host => node.host_value.as_ref(),
        }
    }

    fn set_tier_value(
        &mut self,
        id: NodeId,
        tier: MemoryTier,
        slots: Vec<SlotId>,
    ) -> Result<(), CacheError> {
        match tier {
            MemoryTier::Device => self.set_value(id, Some(slots))?,
            MemoryTier::Host => self.set_host_value(id, Some(slots))?,
        };
        Ok(())
    }

    fn insert_tier(
        &mut self,
        tokens: &[TokenId],
        slots: &[SlotId],
        hints: &NodeHints,
        tier: MemoryTier,
    ) -> Result<InsertOutcome, CacheError> {
        if tokens.len() != slots.len() {
            return Err(CacheError::LengthMismatch {
                tokens: tokens.len(),
                slots: slots.len(),
            });
        }

        let now = self.now();
        let mut cur = self.root;
        let mut pos = 0;
        let mut new_tokens = 0;
        let mut revived_tokens = 0;
        let mut duplicate_slots = Vec::new();

        while pos < tokens.len() {
            let Some(child) = self.get(cur)?.child(tokens[pos]) else {
                let parent_meta = self.get(cur)?.metadata.clone();
                let metadata = NodeMetadata {
                    last_access_time: now,
                    creation_time: now,
                    hit_count: 0,
                    priority: hints.priority.unwrap_or(parent_meta.priority),
                    workflow_eviction_value: hints
                        .workflow_eviction_value
                        .or(parent_meta.workflow_eviction_value),
                };
                let leaf = TreeNode::new(tokens[pos..].to_vec(), cur, metadata);
                let leaf_id = self.alloc_node(leaf);
                self.get_mut(cur)?.children.insert(tokens[pos], leaf_id);
                self.set_tier_value(leaf_id, tier, slots[pos..].to_vec())?;

                new_tokens += tokens.len() - pos;
                pos = tokens.len();
                cur = leaf_id;
                break;
            };

            let node = self.get(child)?;
            let common = common_prefix_len(&node.key, &tokens[pos..]);

            // In-flight nodes are never split or written; their slots arrive via prefetch.
            if node.is_prefetching {
                if common == node.key.len() {
                    duplicate_slots.extend_from_slice(&slots[pos..pos + common]);
                    pos += common;
                    cur = child;
                    continue;
                }
                duplicate_slots.extend_from_slice(&slots[pos..]);
                pos = tokens.len();
                break;
            }

            let target = if common < node.key.len() {
                self.split_node(child, common)?
            } else {
                child
            };

            let segment = &slots[pos..pos + common];
            if Self::tier_value(self.get(target)?, tier).is_some() {
                duplicate_slots.extend_from_slice(segment);
            } else {
                self.set_tier_value(target, tier, segment.to_vec())?;
                revived_tokens += common;
            }
            self.get_mut(target)?.metadata.last_access_time = now;

            pos += common;
            cur = target;
        }

        debug!(
            tier = %tier,
            tokens = tokens.len(),
            new_tokens,
            revived_tokens,
            duplicates = duplicate_slots.len(),
            "Inserted sequence"
        );

        Ok(InsertOutcome {
            new_tokens,
            revived_tokens,
            duplicate_slots,
            last_node: cur,
        })
    }

    // ─── Eviction ───────────────────────────────────────────────────────────

    /// Whether a node may give up its device slots now.
    fn is_evictable(&self, id: NodeId) -> bool {
        if id == self.root {
            return false;
        }
        let Some(node) = self.node(id) else {
            return false;
        };
        if node.value.is_none() || node.lock_count > 0 || node.is_prefetching {
            return false;
        }
        node.children().all(|c| {
            self.node(c)
                .map_or(true, |child| child.value.is_none() && !child.is_prefetching)
        })
    }

    /// Device tokens held by `id` and its descendants.
    pub fn subtree_device_tokens(&self, id: NodeId) -> usize {
        let mut total = 0;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.node(cur) {
                total += node.device_tokens();
                stack.extend(node.children());
            }
        }
        total
    }

    fn candidate(&self, id: NodeId) -> Option<EvictionCandidate> {
        let node = self.node(id)?;
        let footprint = if self.strategy.needs_footprint() {
            self.subtree_device_tokens(id)
        } else {
            0
        };
        Some(EvictionCandidate {
            node: id,
            key: self.strategy.priority(node, footprint),
            order: node.metadata.creation_time,
        })
    }

    /// Reclaim at least `needed` device slots from unlocked leaves.
    ///
    /// Returns the number of slots freed. If candidates run out first, the
    /// slots freed so far stay freed and `CapacityExhausted` is returned.
    pub fn evict(&mut self, needed: usize) -> Result<usize, CacheError> {
        if needed == 0 {
            return Ok(0);
        }

        let mut queue = CandidateQueue::new();
        let ids: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        for id in ids {
            if self.is_evictable(id) {
                if let Some(c) = self.candidate(id) {
                    queue.push(c);
                }
            }
        }

        let mut freed = 0;
        let mut evicted = 0;
        while freed < needed {
            let Some(victim) = queue.pop() else {
                warn!(needed, freed, "Eviction ran out of candidates");
                return Err(CacheError::CapacityExhausted {
                    requested: needed,
                    freed,
                });
            };
            if !self.is_evictable(victim.node) {
                continue;
            }

            let parent = self.get(victim.node)?.parent;
            freed += self.evict_node(victim.node)?;
            evicted += 1;

            if let Some(parent) = parent {
                if self.is_evictable(parent) {
                    if let Some(c) = self.candidate(parent) {
                        queue.push(c);
                    }
                }
            }
        }

        info!(
            evicted,
            freed,
            needed,
            strategy = %self.strategy,
            total = self.total_device_tokens,
            "Eviction round complete"
        );
        Ok(freed)
    }

    /// Drop one node's device slots, demoting to host when configured.
    fn evict_node(&mut self, id: NodeId) -> Result<usize, CacheError> {
        let node = self.get(id)?;
        if node.lock_count > 0 || node.is_prefetching {
            return Err(self.violation(format!(
                "evicting protected node {id} (locks {}, prefetching {})",
                node.lock_count, node.is_prefetching
            )));
        }
        let demote = self.demote_on_evict && node.host_value.is_none();
        let tokens = node.device_tokens();

        // Reserve before clearing the device value: host eviction only prunes cold nodes.
        let host = if demote {
            self.reserve_host_slots(id, tokens)?
        } else {
            None
        };

        let Some(slots) = self.set_value(id, None)? else {
            return Ok(0);
        };

        if let Some(host) = host {
            match self.pool.backup_to_host(&slots, &host) {
                Ok(()) => {
                    self.set_host_value(id, Some(host))?;
                }
                Err(e) => {
                    warn!(node = %id, error = %e, "Demotion copy failed, dropping");
                    self.pool.release_host(&host)?;
                }
            }
        }

        self.pool.release(&slots)?;
        debug!(node = %id, slots = slots.len(), "Evicted node");

        self.prune_cold(id)?;
        Ok(slots.len())
    }

    /// Reserve host slots for demoting `id`, reclaiming the coldest host-only
    /// leaves once if the host tier is full. `None` means demotion is skipped.
    fn reserve_host_slots(
        &mut self,
        id: NodeId,
        count: usize,
    ) -> Result<Option<Vec<SlotId>>, CacheError> {
        let shortfall = match self.pool.reserve_host(count) {
            Ok(host) => return Ok(Some(host)),
            Err(AllocError::OutOfSlots { available, .. }) => count - available,
            Err(e) => return Err(e.into()),
        };

        match self.evict_host(shortfall) {
            Ok(_) | Err(CacheError::CapacityExhausted { .. }) => {}
            Err(e) => return Err(e),
        }

        match self.pool.reserve_host(count) {
            Ok(host) => Ok(Some(host)),
            Err(e) => {
                debug!(node = %id, error = %e, "No host room, dropping instead of demoting");
                Ok(None)
            }
        }
    }

    /// Remove `id` and then its ancestors while they are unreferenced cold leaves.
    fn prune_cold(&mut self, id: NodeId) -> Result<(), CacheError> {
        let mut cur = id;
        while cur != self.root {
            let node = self.get(cur)?;
            let removable = node.is_leaf()
                && node.value.is_none()
                && node.host_value.is_none()
                && !node.is_prefetching
                && node.lock_count == 0;
            if !removable {
                break;
            }
            let parent = node.parent.unwrap_or(self.root);
            self.remove_node(cur)?;
            cur = parent;
        }
        Ok(())
    }

    fn is_host_evictable(&self, id: NodeId) -> bool {
        if id == self.root {
            return false;
        }
        self.node(id).is_some_and(|n| {
            n.host_value.is_some()
                && n.value.is_none()
                && !n.is_prefetching
                && n.lock_count == 0
                && n.is_leaf()
        })
    }

    /// Reclaim at least `needed` host slots from host-only leaves.
    pub fn evict_host(&mut self, needed: usize) -> Result<usize, CacheError> {
        if needed == 0 {
            return Ok(0);
        }

        let mut queue = CandidateQueue::new();
        let ids: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        for id in ids {
            if self.is_host_evictable(id) {
                if let Some(c) = self.candidate(id) {
                    queue.push(c);
                }
            }
        }

        let mut freed = 0;
        while freed < needed {
            let Some(victim) = queue.pop() else {
                warn!(needed, freed, "Host eviction ran out of candidates");
                return Err(CacheError::CapacityExhausted {
                    requested: needed,
                    freed,
                });
            };
            if !self.is_host_evictable(victim.node) {
                continue;
            }

            let parent = self.get(victim.node)?.parent;
            if let Some(host) = self.set_host_value(victim.node, None)? {
                self.pool.release_host(&host)?;
                freed += host.len();
            }
            self.prune_cold(victim.node)?;

            if let Some(parent) = parent {
                if self.is_host_evictable(parent) {
                    if let Some(c) = self.candidate(parent) {
                        queue.push(c);
                    }
                }
            }
        }

        info!(freed, needed, host = self.host_tokens, "Host eviction round complete");
        Ok(freed)
    }

    // ─── Diagnostics ────────────────────────────────────────────────────────

    /// Recompute every counter by full traversal and compare. Cold path.
    pub fn check_invariants(&self) -> Result<(), CacheError> {
        let mut total = 0;
        let mut evictable = 0;
        let mut protected = 0;
        let mut host = 0;

        for (id, node) in self.nodes() {
            total += node.device_tokens();
            host += node.host_tokens();
            if node.lock_count > 0 {
                protected += node.device_tokens();
            } else {
                evictable += node.device_tokens();
            }

            if node.is_prefetching
                && (node.value.is_some()
                    || node.pending_device_indices.as_ref().map_or(true, Vec::is_empty)
                    || node.completion_handle.is_none())
            {
                return Err(self.violation(format!("prefetching node {id} has bad state")));
            }
            for v in [&node.value, &node.host_value].into_iter().flatten() {
                if v.len() != node.key.len() {
                    return Err(self.violation(format!("node {id} slot/key length mismatch")));
                }
            }
            for (&first, &child) in &node.children {
                let c = self.get(child)?;
                if c.key.first() != Some(&first) || c.parent != Some(id) {
                    return Err(self.violation(format!("node {id} has a mislinked child {child}")));
                }
            }
        }

        if total != self.total_device_tokens
            || evictable != self.evictable_device_tokens
            || protected != self.protected_device_tokens
            || host != self.host_tokens
        {
            return Err(self.violation(format!(
                "counter drift: total {total}/{}, evictable {evictable}/{}, protected {protected}/{}, host {host}/{}",
                self.total_device_tokens,
                self.evictable_device_tokens,
                self.protected_device_tokens,
                self.host_tokens
            )));
        }
        Ok(())
    }
}
