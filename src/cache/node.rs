//! Radix tree node types.
//!
//! A node holds one edge-labelled segment of a cached token sequence. Nodes
//! live in an arena owned by the tree and refer to each other through
//! generational [`NodeId`] handles, so parent links never own anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pool::allocator::SlotId;
use crate::transfer::handle::TransferHandle;

/// A token id from the model vocabulary.
pub type TokenId = u32;

/// Arena handle for a tree node.
///
/// A handle is only valid while its generation matches the arena slot; once
/// the node is removed and the slot reused, old handles resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Where a node's KV state currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Residency {
    /// Not resident anywhere. Must be recomputed.
    Cold,
    /// Only a host copy exists.
    HostResident,
    /// A host-to-device copy is in flight.
    Prefetching,
    /// Resident in device memory (a host copy may also exist).
    DeviceResident,
}

impl std::fmt::Display for Residency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Residency::Cold => write!(f, "cold"),
            Residency::HostResident => write!(f, "host"),
            Residency::Prefetching => write!(f, "prefetching"),
            Residency::DeviceResident => write!(f, "device"),
        }
    }
}

/// Scalar metadata consumed by eviction strategies.
///
/// Times are ticks of the owning cache's logical clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub last_access_time: u64,
    pub creation_time: u64,
    pub hit_count: u64,
    /// Static priority; lower values are evicted first.
    pub priority: i64,
    /// Predicted steps until this prefix is needed again, if known.
    pub workflow_eviction_value: Option<i64>,
}

/// Optional hints applied to nodes created by an insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeHints {
    pub priority: Option<i64>,
    pub workflow_eviction_value: Option<i64>,
}

/// One node of the prefix tree.
#[derive(Debug)]
pub struct TreeNode {
    /// Edge label. Empty only for the root.
    pub(crate) key: Vec<TokenId>,

    /// Children keyed by the first token of their edge.
    pub(crate) children: HashMap<TokenId, NodeId>,

    /// Back-reference for upward traversal. `None` only for the root.
    pub(crate) parent: Option<NodeId>,

    /// Device slots, one per key token, when device resident.
    pub(crate) value: Option<Vec<SlotId>>,

    /// Host slots, one per key token, when a host copy exists.
    pub(crate) host_value: Option<Vec<SlotId>>,

    /// In-flight requests referencing this node or a descendant.
    pub(crate) lock_count: usize,

    pub(crate) is_prefetching: bool,

    /// Device slots reserved for an in-flight prefetch, not yet valid.
    pub(crate) pending_device_indices: Option<Vec<SlotId>>,

    pub(crate) completion_handle: Option<TransferHandle>,

    pub(crate) metadata: NodeMetadata,
}

impl TreeNode {
    pub(crate) fn root() -> Self {
        Self {
            key: Vec::new(),
            children: HashMap::new(),
            parent: None,
            value: None,
            host_value: None,
            lock_count: 1,
            is_prefetching: false,
            pending_device_indices: None,
            completion_handle: None,
            metadata: NodeMetadata::default(),
        }
    }

    pub(crate) fn new(key: Vec<TokenId>, parent: NodeId, metadata: NodeMetadata) -> Self {
        Self {
            key,
            children: HashMap::new(),
            parent: Some(parent),
            value: None,
            host_value: None,
            lock_count: 0,
            is_prefetching: false,
            pending_device_indices: None,
            completion_handle: None,
            metadata,
        }
    }

    /// Record an access at logical time `now`.
    pub(crate) fn touch(&mut self, now: u64) {
        self.metadata.last_access_time = now;
        self.metadata.hit_count += 1;
    }

    pub fn key(&self) -> &[TokenId] {
        &self.key
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn child(&self, first_token: TokenId) -> Option<NodeId> {
        self.children.get(&first_token).copied()
    }

    pub fn value(&self) -> Option<&[SlotId]> {
        self.value.as_deref()
    }

    pub fn host_value(&self) -> Option<&[SlotId]> {
        self.host_value.as_deref()
    }

    pub fn pending_device_indices(&self) -> Option<&[SlotId]> {
        self.pending_device_indices.as_deref()
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    pub fn is_prefetching(&self) -> bool {
        self.is_prefetching
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Number of tokens on this node's edge.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    pub fn is_device_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn residency(&self) -> Residency {
        if self.is_prefetching {
            Residency::Prefetching
        } else if self.value.is_some() {
            Residency::DeviceResident
        } else if self.host_value.is_some() {
            Residency::HostResident
        } else {
            Residency::Cold
        }
    }

    /// Device tokens this node counts toward the resident aggregate.
    pub(crate) fn device_tokens(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    pub(crate) fn host_tokens(&self) -> usize {
        self.host_value.as_ref().map_or(0, Vec::len)
    }
}

/// Length of the common prefix of two token slices.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: Vec<TokenId>) -> TreeNode {
        TreeNode::new(key, NodeId::new(0, 0), NodeMetadata::default())
    }

    #[test]
    fn test_residency_transitions() {
        let mut n = node(vec![1, 2]);
        assert_eq!(n.residency(), Residency::Cold);

        n.host_value = Some(vec![5, 6]);
        assert_eq!(n.residency(), Residency::HostResident);

        n.is_prefetching = true;
        n.pending_device_indices = Some(vec![20, 21]);
        assert_eq!(n.residency(), Residency::Prefetching);

        n.is_prefetching = false;
        n.value = n.pending_device_indices.take();
        assert_eq!(n.residency(), Residency::DeviceResident);
        assert_eq!(n.device_tokens(), 2);
    }

    #[test]
    fn test_touch_updates_metadata() {
        let mut n = node(vec![1]);
        n.touch(7);
        n.touch(9);
        assert_eq!(n.metadata.last_access_time, 9);
        assert_eq!(n.metadata.hit_count, 2);
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix_len(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(common_prefix_len(&[9], &[1]), 0);
        assert_eq!(common_prefix_len(&[], &[1]), 0);
    }

    #[test]
    fn test_root_is_locked() {
        let root = TreeNode::root();
        assert_eq!(root.lock_count(), 1);
        assert!(root.parent().is_none());
        assert!(root.is_empty());
    }
}
