//! prefix-kv-cache: prefix-sharing KV cache core for LLM inference.
//!
//! Maps token sequences to device KV slots through a radix tree, evicts
//! unlocked prefixes with a pluggable strategy, and promotes host-resident
//! prefixes back to the device on a dedicated transfer lane:
//!   Device (hot) ← prefetch ← Host (warm) ← demote ← Device

pub mod cache;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod transfer;
