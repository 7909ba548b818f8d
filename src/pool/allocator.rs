//! Slot allocator for KV cache token slots.
//!
//! Manages a fixed range of slot indices as a free list. One slot holds the
//! KV state of one token. Uses a FIFO free list with O(1) reserve per slot.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::transfer::handle::TransferError;

/// A slot index into a tier's KV buffer.
pub type SlotId = usize;

/// Which memory tier a slot range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Device memory (hot, where attention runs).
    Device,
    /// Host memory (warm, overflow for demoted prefixes).
    Host,
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Device => write!(f, "device"),
            MemoryTier::Host => write!(f, "host"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of {tier} slots: requested {requested}, available {available}")]
    OutOfSlots {
        tier: MemoryTier,
        requested: usize,
        available: usize,
    },

    #[error("Slot {slot} is not a reserved {tier} slot")]
    UnknownSlot { tier: MemoryTier, slot: SlotId },

    #[error("Host backup copy failed: {0}")]
    BackupFailed(TransferError),
}

/// Free-list allocator over the slots `[0, capacity)` of one tier.
#[derive(Debug)]
pub struct SlotAllocator {
    tier: MemoryTier,

    /// Free slot indices, reserved from the front.
    free_list: VecDeque<SlotId>,

    /// Reservation flag per slot, used to reject double frees.
    reserved: Vec<bool>,

    /// Number of reserved slots.
    allocated: usize,
}

impl SlotAllocator {
    pub fn new(tier: MemoryTier, capacity: usize) -> Self {
        Self {
            tier,
            free_list: (0..capacity).collect(),
            reserved: vec![false; capacity],
            allocated: 0,
        }
    }

    /// Reserve `count` slots. All-or-nothing: on failure nothing is reserved.
    pub fn reserve(&mut self, count: usize) -> Result<Vec<SlotId>, AllocError> {
        if count > self.free_list.len() {
            return Err(AllocError::OutOfSlots {
                tier: self.tier,
                requested: count,
                available: self.free_list.len(),
            });
        }

        let slots: Vec<SlotId> = self.free_list.drain(..count).collect();
        for &slot in &slots {
            self.reserved[slot] = true;
        }
        self.allocated += count;

        debug!(tier = %self.tier, count, allocated = self.allocated, "Reserved slots");
        Ok(slots)
    }

    /// Return slots to the free list.
    ///
    /// Validates the whole batch first so a bad slot leaves the allocator untouched.
    pub fn release(&mut self, slots: &[SlotId]) -> Result<(), AllocError> {
        for &slot in slots {
            if !self.reserved.get(slot).copied().unwrap_or(false) {
                return Err(AllocError::UnknownSlot {
                    tier: self.tier,
                    slot,
                });
            }
        }

        for &slot in slots {
            self.reserved[slot] = false;
            self.free_list.push_back(slot);
        }
        self.allocated = self.allocated.saturating_sub(slots.len());

        debug!(tier = %self.tier, count = slots.len(), allocated = self.allocated, "Released slots");
        Ok(())
    }

    /// Total slots managed by this allocator.
    pub fn capacity(&self) -> usize {
        self.reserved.len()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Slots currently reserved.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity() == 0 {
            return 0.0;
        }
        self.allocated as f64 / self.capacity() as f64
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }
}
