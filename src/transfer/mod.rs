//! Data transfer between tiers.
//!
//! - [`handle`]: Completion handles polled by the scheduler thread
//! - [`buffer`]: Slot-addressed KV byte buffers per tier
//! - [`lane`]: Dedicated host-to-device copy lane

pub mod buffer;
pub mod handle;
pub mod lane;
