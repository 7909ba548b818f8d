//! Completion handles for asynchronous transfers.
//!
//! A transfer is issued on the copy lane and observed from the scheduler
//! thread through a [`TransferHandle`]. The handle is only ever queried
//! without blocking; the lane resolves it through the paired
//! [`TransferSignal`].

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::pool::allocator::{MemoryTier, SlotId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer lane closed before the copy completed")]
    LaneClosed,

    #[error("{tier} slot {slot} is outside the buffer")]
    SlotOutOfRange { tier: MemoryTier, slot: SlotId },

    #[error("Copy length mismatch: {src} source slots, {dst} destination slots")]
    LengthMismatch { src: usize, dst: usize },
}

/// Observed state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Complete,
    Failed(TransferError),
}

/// Receiving side of a transfer's completion signal.
#[derive(Debug)]
pub struct TransferHandle {
    rx: oneshot::Receiver<Result<(), TransferError>>,
    resolved: Option<Result<(), TransferError>>,
}

impl TransferHandle {
    /// Query the transfer without blocking.
    ///
    /// Once resolved, the same status is returned on every later call.
    pub fn poll(&mut self) -> TransferStatus {
        if self.resolved.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.resolved = Some(result),
                Err(TryRecvError::Empty) => return TransferStatus::Pending,
                Err(TryRecvError::Closed) => self.resolved = Some(Err(TransferError::LaneClosed)),
            }
        }

        match &self.resolved {
            Some(Ok(())) => TransferStatus::Complete,
            Some(Err(e)) => TransferStatus::Failed(e.clone()),
            None => TransferStatus::Pending,
        }
    }
}

/// Sending side held by whoever performs the copy.
#[derive(Debug)]
pub struct TransferSignal {
    tx: oneshot::Sender<Result<(), TransferError>>,
}

impl TransferSignal {
    pub fn complete(self) {
        // The handle may have been dropped after a cancel; nothing to notify then.
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: TransferError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Create a linked signal/handle pair.
pub fn transfer_channel() -> (TransferSignal, TransferHandle) {
    let (tx, rx) = oneshot::channel();
    (
        TransferSignal { tx },
        TransferHandle { rx, resolved: None },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_until_signaled() {
        let (signal, mut handle) = transfer_channel();
        assert_eq!(handle.poll(), TransferStatus::Pending);
        assert_eq!(handle.poll(), TransferStatus::Pending);

        signal.complete();
        assert_eq!(handle.poll(), TransferStatus::Complete);
        // Sticky after resolution.
        assert_eq!(handle.poll(), TransferStatus::Complete);
    }

    #[test]
    fn test_dropped_signal_is_lane_closed() {
        let (signal, mut handle) = transfer_channel();
        drop(signal);
        assert_eq!(
            handle.poll(),
            TransferStatus::Failed(TransferError::LaneClosed)
        );
    }

    #[test]
    fn test_failure_is_reported() {
        let (signal, mut handle) = transfer_channel();
        signal.fail(TransferError::LengthMismatch { src: 2, dst: 3 });
        assert!(matches!(
            handle.poll(),
            TransferStatus::Failed(TransferError::LengthMismatch { src: 2, dst: 3 })
        ));
    }
}
