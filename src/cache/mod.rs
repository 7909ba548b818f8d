//! Prefix-sharing KV cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`node`]: Tree node, arena handles, residency and eviction metadata
//! - [`radix_tree`]: The prefix tree (match, insert, unlock, evict)
//! - [`evictor`]: Eviction strategies and candidate ordering
//! - [`prefetcher`]: Asynchronous host-to-device promotion
//! - [`node_stats`]: Full-tree diagnostics

pub mod evictor;
pub mod node;
pub mod node_stats;
pub mod prefetcher;
pub mod radix_tree;
