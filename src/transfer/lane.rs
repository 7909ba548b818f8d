//! Host-to-device copy lane.
//!
//! Copies issued for prefetch run on a dedicated worker, separate from the
//! thread that drives the cache, so promotion overlaps with compute. The
//! driving side only enqueues jobs and later polls the returned handles.
//!
//! The lane is split in two halves: [`TransferLane`] (cheap to clone, used to
//! submit) and [`LaneWorker`] (owns the queue and the buffers). Production code
//! runs [`LaneWorker::run`] on a blocking thread; tests call
//! [`LaneWorker::drain`] to complete queued copies at a chosen point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pool::allocator::SlotId;
use crate::transfer::buffer::{lock_tiers, SharedBuffer};
use crate::transfer::handle::{transfer_channel, TransferError, TransferHandle, TransferSignal};

/// A queued host-to-device copy.
#[derive(Debug)]
struct CopyJob {
    id: u64,
    host_slots: Vec<SlotId>,
    device_slots: Vec<SlotId>,
    signal: TransferSignal,
}

/// Lane counters, shared between both halves.
#[derive(Debug, Default)]
pub struct LaneStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_copied: AtomicU64,
}

/// Submitting half of the lane.
#[derive(Debug, Clone)]
pub struct TransferLane {
    tx: mpsc::UnboundedSender<CopyJob>,
    next_id: Arc<AtomicU64>,
    stats: Arc<LaneStats>,
}

/// Executing half of the lane.
pub struct LaneWorker {
    rx: mpsc::UnboundedReceiver<CopyJob>,
    host: SharedBuffer,
    device: SharedBuffer,
    stats: Arc<LaneStats>,
}

impl TransferLane {
    /// Create a lane copying from `host` into `device`.
    pub fn new(host: SharedBuffer, device: SharedBuffer) -> (TransferLane, LaneWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(LaneStats::default());

        let lane = TransferLane {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
            stats: stats.clone(),
        };
        let worker = LaneWorker {
            rx,
            host,
            device,
            stats,
        };
        (lane, worker)
    }

    /// Enqueue a copy and return its completion handle. Never blocks.
    ///
    /// If the worker is gone the handle resolves as failed on first poll.
    pub fn submit(&self, host_slots: &[SlotId], device_slots: &[SlotId]) -> TransferHandle {
        let (signal, handle) = transfer_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let job = CopyJob {
            id,
            host_slots: host_slots.to_vec(),
            device_slots: device_slots.to_vec(),
            signal,
        };

        match self.tx.send(job) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(job = id, slots = host_slots.len(), "Queued H2D copy");
            }
            Err(mpsc::error::SendError(job)) => {
                warn!(job = id, "Transfer lane closed, failing copy");
                job.signal.fail(TransferError::LaneClosed);
            }
        }

        handle
    }

    pub fn stats(&self) -> &LaneStats {
        &self.stats
    }
}

impl LaneWorker {
    /// Process copies until every [`TransferLane`] is dropped.
    ///
    /// Blocks the calling thread: copies hold the buffer locks, so run this
    /// on a dedicated thread (`spawn_blocking`), never on an async worker.
    pub fn run(mut self) {
        info!("Transfer lane started");
        while let Some(job) = self.rx.blocking_recv() {
            self.execute(job);
        }
        info!("Transfer lane stopped");
    }

    /// Execute every copy currently queued, returning how many ran.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.execute(job);
            ran += 1;
        }
        ran
    }

    fn execute(&self, job: CopyJob) {
        let result = {
            let (host, mut device) = lock_tiers(&self.host, &self.device);
            device.copy_from(&host, &job.host_slots, &job.device_slots)
        };

        match result {
            Ok(bytes) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_copied
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                debug!(job = job.id, bytes, "H2D copy complete");
                job.signal.complete();
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job = job.id, error = %e, "H2D copy failed");
                job.signal.fail(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::allocator::MemoryTier;
    use crate::transfer::buffer::{lock_buffer, KvBuffer};
    use crate::transfer::handle::TransferStatus;

    fn buffers() -> (SharedBuffer, SharedBuffer) {
        (
            KvBuffer::shared(MemoryTier::Host, 8, 4),
            KvBuffer::shared(MemoryTier::Device, 8, 4),
        )
    }

    #[test]
    fn test_copy_completes_on_drain() {
        let (host, device) = buffers();
        lock_buffer(&host).write_slot(5, &[9; 4]).unwrap();

        let (lane, mut worker) = TransferLane::new(host, device.clone());
        let mut handle = lane.submit(&[5], &[1]);
        assert_eq!(handle.poll(), TransferStatus::Pending);

        assert_eq!(worker.drain(), 1);
        assert_eq!(handle.poll(), TransferStatus::Complete);
        assert_eq!(lock_buffer(&device).read_slot(1).unwrap(), &[9; 4]);
        assert_eq!(lane.stats().completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bad_slot_fails_copy() {
        let (host, device) = buffers();
        let (lane, mut worker) = TransferLane::new(host, device);

        let mut handle = lane.submit(&[0], &[42]);
        worker.drain();
        assert!(matches!(
            handle.poll(),
            TransferStatus::Failed(TransferError::SlotOutOfRange { slot: 42, .. })
        ));
        assert_eq!(lane.stats().failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_submit_after_worker_dropped() {
        let (host, device) = buffers();
        let (lane, worker) = TransferLane::new(host, device);
        drop(worker);

        let mut handle = lane.submit(&[0], &[0]);
        assert_eq!(
            handle.poll(),
            TransferStatus::Failed(TransferError::LaneClosed)
        );
    }

    #[tokio::test]
    async fn test_spawned_worker() {
        let (host, device) = buffers();
        let (lane, worker) = TransferLane::new(host, device);
        let task = tokio::task::spawn_blocking(move || worker.run());

        let mut handle = lane.submit(&[0, 1], &[2, 3]);
        while handle.poll() == TransferStatus::Pending {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.poll(), TransferStatus::Complete);

        drop(lane);
        task.await.unwrap();
    }
}
