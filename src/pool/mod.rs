//! KV slot pools.
//!
//! - [`allocator`]: Free-list slot allocator per memory tier
//! - [`kv_pool`]: The pool contract used by the cache and a tiered implementation

pub mod allocator;
pub mod kv_pool;
