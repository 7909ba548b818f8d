//! The KV slot pool contract used by the cache, and a tiered implementation.
//!
//! The cache never owns memory. It reserves and releases slots through
//! [`KvPool`], and treats a failed reservation as a normal outcome.

use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::pool::allocator::{AllocError, MemoryTier, SlotAllocator, SlotId};
use crate::transfer::buffer::{lock_tiers, KvBuffer, SharedBuffer};
use crate::transfer::handle::TransferHandle;
use crate::transfer::lane::{LaneWorker, TransferLane};

/// Memory operations the cache needs from the slot allocator.
pub trait KvPool: Send {
    /// Reserve `count` device slots. Must not block.
    fn reserve(&mut self, count: usize) -> Result<Vec<SlotId>, AllocError>;

    /// Return device slots to the free pool.
    fn release(&mut self, slots: &[SlotId]) -> Result<(), AllocError>;

    /// Start an asynchronous host-to-device copy on the transfer lane.
    fn copy_host_to_device(&mut self, host: &[SlotId], device: &[SlotId]) -> TransferHandle;

    /// Total device slots.
    fn capacity(&self) -> usize;

    /// Free device slots.
    fn available(&self) -> usize;

    /// Reserve `count` host slots.
    fn reserve_host(&mut self, count: usize) -> Result<Vec<SlotId>, AllocError>;

    /// Return host slots to the free pool.
    fn release_host(&mut self, slots: &[SlotId]) -> Result<(), AllocError>;

    /// Total host slots.
    fn host_capacity(&self) -> usize;

    /// Copy device slots into host slots, completing before it returns.
    fn backup_to_host(&mut self, device: &[SlotId], host: &[SlotId]) -> Result<(), AllocError>;
}

/// Device + host slot pool backed by in-memory buffers.
pub struct TieredSlotPool {
    device: SlotAllocator,
    host: SlotAllocator,
    device_buffer: SharedBuffer,
    host_buffer: SharedBuffer,
    lane: TransferLane,
}

impl TieredSlotPool {
    /// Build the pool and its transfer lane. The caller runs the returned worker.
    pub fn new(config: &PoolConfig) -> (Self, LaneWorker) {
        let device_buffer =
            KvBuffer::shared(MemoryTier::Device, config.device_slots, config.slot_bytes);
        let host_buffer = KvBuffer::shared(MemoryTier::Host, config.host_slots, config.slot_bytes);
        let (lane, worker) = TransferLane::new(host_buffer.clone(), device_buffer.clone());

        let pool = Self {
            device: SlotAllocator::new(MemoryTier::Device, config.device_slots),
            host: SlotAllocator::new(MemoryTier::Host, config.host_slots),
            device_buffer,
            host_buffer,
            lane,
        };
        (pool, worker)
    }

    pub fn device_buffer(&self) -> &SharedBuffer {
        &self.device_buffer
    }

    pub fn host_buffer(&self) -> &SharedBuffer {
        &self.host_buffer
    }

    /// Device utilization as a fraction of capacity.
    pub fn utilization(&self) -> f64 {
        self.device.utilization()
    }
}

impl KvPool for TieredSlotPool {
    fn reserve(&mut self, count: usize) -> Result<Vec<SlotId>, AllocError> {
        self.device.reserve(count)
    }

    fn release(&mut self, slots: &[SlotId]) -> Result<(), AllocError> {
        self.device.release(slots)
    }

    fn copy_host_to_device(&mut self, host: &[SlotId], device: &[SlotId]) -> TransferHandle {
        self.lane.submit(host, device)
    }

    fn capacity(&self) -> usize {
        self.device.capacity()
    }

    fn available(&self) -> usize {
        self.device.available()
    }

    fn reserve_host(&mut self, count: usize) -> Result<Vec<SlotId>, AllocError> {
        self.host.reserve(count)
    }

    fn release_host(&mut self, slots: &[SlotId]) -> Result<(), AllocError> {
        self.host.release(slots)
    }

    fn host_capacity(&self) -> usize {
        self.host.capacity()
    }

    fn backup_to_host(&mut self, device: &[SlotId], host: &[SlotId]) -> Result<(), AllocError> {
        let (mut host_buf, device_buf) = lock_tiers(&self.host_buffer, &self.device_buffer);

        match host_buf.copy_from(&device_buf, device, host) {
            Ok(bytes) => {
                debug!(slots = device.len(), bytes, "D2H backup complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "D2H backup failed");
                Err(AllocError::BackupFailed(e))
            }
        }
    }
}
