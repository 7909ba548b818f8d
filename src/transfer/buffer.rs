//! Slot-addressed KV buffers.
//!
//! Each tier's KV state is a flat byte region split into fixed-size slots.
//! The buffers are shared between the pool (synchronous demotion copies) and
//! the transfer lane (asynchronous promotion copies).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pool::allocator::{MemoryTier, SlotId};
use crate::transfer::handle::TransferError;

/// Byte storage for one tier.
#[derive(Debug)]
pub struct KvBuffer {
    tier: MemoryTier,
    slot_bytes: usize,
    data: Vec<u8>,
}

/// A buffer shared across threads.
pub type SharedBuffer = Arc<Mutex<KvBuffer>>;

impl KvBuffer {
    pub fn new(tier: MemoryTier, slots: usize, slot_bytes: usize) -> Self {
        Self {
            tier,
            slot_bytes,
            data: vec![0u8; slots * slot_bytes],
        }
    }

    pub fn shared(tier: MemoryTier, slots: usize, slot_bytes: usize) -> SharedBuffer {
        Arc::new(Mutex::new(Self::new(tier, slots, slot_bytes)))
    }

    pub fn slots(&self) -> usize {
        if self.slot_bytes == 0 {
            return 0;
        }
        self.data.len() / self.slot_bytes
    }

    fn range(&self, slot: SlotId) -> Result<std::ops::Range<usize>, TransferError> {
        if slot >= self.slots() {
            return Err(TransferError::SlotOutOfRange {
                tier: self.tier,
                slot,
            });
        }
        let start = slot * self.slot_bytes;
        Ok(start..start + self.slot_bytes)
    }

    pub fn read_slot(&self, slot: SlotId) -> Result<&[u8], TransferError> {
        let range = self.range(slot)?;
        Ok(&self.data[range])
    }

    /// Fill a slot with `bytes`, truncated or zero-padded to the slot size.
    pub fn write_slot(&mut self, slot: SlotId, bytes: &[u8]) -> Result<(), TransferError> {
        let range = self.range(slot)?;
        let dst = &mut self.data[range];
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        dst[n..].fill(0);
        Ok(())
    }

    /// Copy `src_slots` of `src` into `dst_slots` of `self`, slot by slot.
    pub fn copy_from(
        &mut self,
        src: &KvBuffer,
        src_slots: &[SlotId],
        dst_slots: &[SlotId],
    ) -> Result<usize, TransferError> {
        if src_slots.len() != dst_slots.len() {
            return Err(TransferError::LengthMismatch {
                src: src_slots.len(),
                dst: dst_slots.len(),
            });
        }

        let mut bytes = 0;
        for (&s, &d) in src_slots.iter().zip(dst_slots) {
            let data = src.read_slot(s)?;
            self.write_slot(d, data)?;
            bytes += data.len();
        }
        Ok(bytes)
    }
}

/// Lock a shared buffer. A poisoned lock still holds plain bytes, so recover it.
pub fn lock_buffer(buffer: &SharedBuffer) -> MutexGuard<'_, KvBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock both tiers for a copy between them.
///
/// Always host first, then device. Every path that holds both buffers goes
/// through here so the lane and synchronous demotion cannot deadlock.
pub fn lock_tiers<'a>(
    host: &'a SharedBuffer,
    device: &'a SharedBuffer,
) -> (MutexGuard<'a, KvBuffer>, MutexGuard<'a, KvBuffer>) {
    let host = lock_buffer(host);
    let device = lock_buffer(device);
    (host, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_slot() {
        let mut buf = KvBuffer::new(MemoryTier::Host, 4, 8);
        buf.write_slot(2, &[7u8; 3]).unwrap();

        assert_eq!(buf.read_slot(2).unwrap(), &[7, 7, 7, 0, 0, 0, 0, 0]);
        assert_eq!(buf.read_slot(1).unwrap(), &[0u8; 8]);
        assert!(buf.read_slot(4).is_err());
    }

    #[test]
    fn test_copy_between_buffers() {
        let mut host = KvBuffer::new(MemoryTier::Host, 4, 4);
        let mut device = KvBuffer::new(MemoryTier::Device, 4, 4);
        host.write_slot(0, &[1; 4]).unwrap();
        host.write_slot(1, &[2; 4]).unwrap();

        let bytes = device.copy_from(&host, &[0, 1], &[3, 2]).unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(device.read_slot(3).unwrap(), &[1; 4]);
        assert_eq!(device.read_slot(2).unwrap(), &[2; 4]);
    }

    #[test]
    fn test_copy_length_mismatch() {
        let host = KvBuffer::new(MemoryTier::Host, 4, 4);
        let mut device = KvBuffer::new(MemoryTier::Device, 4, 4);
        let err = device.copy_from(&host, &[0, 1], &[0]).unwrap_err();
        assert_eq!(err, TransferError::LengthMismatch { src: 2, dst: 1 });
    }
}
