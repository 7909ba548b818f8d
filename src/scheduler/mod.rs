//! Scheduler side of the cache.
//!
//! - [`service`]: Single-writer task that owns the cache and drives ticks

pub mod service;
