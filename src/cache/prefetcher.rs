//! Prefetching: promotes host-resident prefixes to device memory before a
//! request needs them.
//!
//! Per-node state machine:
//!
//! ```text
//! Cold -> HostResident -> Prefetching -> DeviceResident
//!              ^               |               |
//!              +--- fail ------+               |
//!              +------------- evict -----------+
//! ```
//!
//! [`PrefetchEngine::request_prefetch`] reserves device slots and starts the
//! copy on the transfer lane. [`PrefetchEngine::tick`] polls the completion
//! handles without blocking and is the only path into `DeviceResident` for a
//! prefetched node. The lane only ever writes slot buffers, never nodes.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::node::NodeId;
use crate::cache::radix_tree::{invariant_violation, CacheError, PrefixCache};
use crate::config::PrefetchConfig;
use crate::pool::allocator::{AllocError, SlotId};
use crate::transfer::handle::{TransferHandle, TransferStatus};

/// What a prefetch request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Slots reserved and the copy is in flight.
    Started,
    AlreadyResident,
    /// No host copy to fetch from.
    NotOnHost,
    AlreadyPrefetching,
    /// Device reservation was denied. Nothing changed; the caller may retry.
    ReservationFailed(AllocError),
    /// The in-flight limit is reached. Nothing changed.
    Throttled,
}

impl PrefetchOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, PrefetchOutcome::Started)
    }
}

/// What one `tick` observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Nodes that became device resident.
    pub committed: usize,
    pub committed_tokens: usize,
    /// Transfers that failed; their reservations were released.
    pub failed: usize,
    /// Slots released from cancelled transfers that have now settled.
    pub drained_slots: usize,
    /// Transfers still in flight.
    pub pending: usize,
}

/// Cumulative prefetch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub started: u64,
    pub committed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub reservation_failures: u64,
    pub throttled: u64,
}

/// Reservation of a cancelled transfer, held until the lane is done with it.
#[derive(Debug)]
struct DrainingReservation {
    slots: Vec<SlotId>,
    handle: TransferHandle,
}

/// Drives host-to-device promotion of tree nodes.
#[derive(Debug)]
pub struct PrefetchEngine {
    /// 0 means unlimited.
    max_in_flight: usize,
    in_flight: Vec<NodeId>,
    draining: Vec<DrainingReservation>,
    stats: PrefetchStats,
}

impl PrefetchEngine {
    pub fn new(config: &PrefetchConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            in_flight: Vec::new(),
            draining: Vec::new(),
            stats: PrefetchStats::default(),
        }
    }

    /// Nodes with a transfer in flight.
    pub fn in_flight(&self) -> &[NodeId] {
        &self.in_flight
    }

    /// Slots held by cancelled transfers that have not settled yet.
    pub fn draining_slots(&self) -> usize {
        self.draining.iter().map(|d| d.slots.len()).sum()
    }

    pub fn stats(&self) -> PrefetchStats {
        self.stats
    }

    /// Start promoting `node` to device memory.
    ///
    /// Only a stale handle is an error. Every no-op and a denied reservation
    /// come back as a [`PrefetchOutcome`] with the node untouched.
    pub fn request_prefetch(
        &mut self,
        cache: &mut PrefixCache,
        node: NodeId,
    ) -> Result<PrefetchOutcome, CacheError> {
        let target = cache.get(node)?;
        if target.is_prefetching {
            return Ok(PrefetchOutcome::AlreadyPrefetching);
        }
        if target.value.is_some() {
            return Ok(PrefetchOutcome::AlreadyResident);
        }
        let Some(host) = target.host_value.clone() else {
            return Ok(PrefetchOutcome::NotOnHost);
        };
        if self.max_in_flight > 0 && self.in_flight.len() >= self.max_in_flight {
            self.stats.throttled += 1;
            return Ok(PrefetchOutcome::Throttled);
        }

        let device = match cache.pool_mut().reserve(host.len()) {
            Ok(slots) => slots,
            Err(e) => {
                debug!(node = %node, slots = host.len(), error = %e, "Prefetch reservation denied");
                self.stats.reservation_failures += 1;
                return Ok(PrefetchOutcome::ReservationFailed(e));
            }
        };

        let handle = cache.pool_mut().copy_host_to_device(&host, &device);

        let target = cache.get_mut(node)?;
        target.is_prefetching = true;
        target.pending_device_indices = Some(device);
        target.completion_handle = Some(handle);

        self.in_flight.push(node);
        self.stats.started += 1;
        debug!(node = %node, slots = host.len(), in_flight = self.in_flight.len(), "Prefetch started");
        Ok(PrefetchOutcome::Started)
    }

    /// Request prefetch for each node in order, e.g. the host continuation
    /// of a match. Stops at the first reservation failure or throttle.
    pub fn request_prefetch_path(
        &mut self,
        cache: &mut PrefixCache,
        nodes: &[NodeId],
    ) -> Result<Vec<PrefetchOutcome>, CacheError> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        for &node in nodes {
            let outcome = self.request_prefetch(cache, node)?;
            let stop = matches!(
                outcome,
                PrefetchOutcome::ReservationFailed(_) | PrefetchOutcome::Throttled
            );
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Poll every in-flight transfer once and commit the finished ones.
    ///
    /// Never blocks. Call once per scheduling iteration.
    pub fn tick(&mut self, cache: &mut PrefixCache) -> Result<TickReport, CacheError> {
        let mut report = TickReport::default();

        let mut settled = Vec::new();
        self.draining.retain_mut(|d| {
            if d.handle.poll() == TransferStatus::Pending {
                true
            } else {
                settled.push(std::mem::take(&mut d.slots));
                false
            }
        });
        for slots in settled {
            cache.pool_mut().release(&slots)?;
            report.drained_slots += slots.len();
        }

        let mut finished = Vec::new();
        let mut fault = None;
        for &id in &self.in_flight {
            match settle(cache, id, &mut report) {
                Ok(true) => finished.push(id),
                Ok(false) => report.pending += 1,
                Err(e) => {
                    warn!(node = %id, error = %e, "Dropping broken prefetch");
                    finished.push(id);
                    fault.get_or_insert(e);
                }
            }
        }

        if !finished.is_empty() {
            self.in_flight.retain(|id| !finished.contains(id));
        }
        self.stats.committed += report.committed as u64;
        self.stats.failed += report.failed as u64;

        if report.committed > 0 || report.failed > 0 {
            info!(
                committed = report.committed,
                tokens = report.committed_tokens,
                failed = report.failed,
                pending = report.pending,
                "Prefetch tick"
            );
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Abandon an in-flight prefetch.
    ///
    /// The node returns to host-resident immediately. Its reserved slots stay
    /// reserved until the lane settles the copy, then `tick` releases them.
    /// Returns `false` if the node was not prefetching.
    pub fn cancel(&mut self, cache: &mut PrefixCache, node: NodeId) -> Result<bool, CacheError> {
        let target = cache.get_mut(node)?;
        if !target.is_prefetching {
            return Ok(false);
        }

        target.is_prefetching = false;
        let slots = target.pending_device_indices.take();
        let handle = target.completion_handle.take();
        let (Some(slots), Some(handle)) = (slots, handle) else {
            return Err(invariant_violation(format!("prefetching node {node} lost its reservation")));
        };

        debug!(node = %node, slots = slots.len(), "Prefetch cancelled");
        self.draining.push(DrainingReservation { slots, handle });
        self.in_flight.retain(|&id| id != node);
        self.stats.cancelled += 1;
        Ok(true)
    }
}

/// Poll one in-flight node and apply the result.
///
/// `Ok(true)` means the node left `Prefetching`. A node whose state is broken
/// is reset to host-resident with its reservation released before the error
/// comes back, so the caller can stop tracking it.
fn settle(cache: &mut PrefixCache, id: NodeId, report: &mut TickReport) -> Result<bool, CacheError> {
    let node = cache.get_mut(id)?;
    let status = match node.completion_handle.as_mut() {
        Some(handle) => handle.poll(),
        None => {
            let slots = node.pending_device_indices.take().unwrap_or_default();
            node.is_prefetching = false;
            cache.pool_mut().release(&slots)?;
            return Err(invariant_violation(format!("prefetching node {id} has no handle")));
        }
    };

    if status == TransferStatus::Pending {
        return Ok(false);
    }
    node.completion_handle = None;
    node.is_prefetching = false;
    let slots = node.pending_device_indices.take().unwrap_or_default();
    let resident = node.value.is_some();

    match status {
        TransferStatus::Complete if resident => {
            cache.pool_mut().release(&slots)?;
            Err(invariant_violation(format!(
                "prefetch commit onto device-resident node {id}"
            )))
        }
        TransferStatus::Failed(e) => {
            warn!(node = %id, error = %e, "Prefetch transfer failed, releasing reservation");
            cache.pool_mut().release(&slots)?;
            report.failed += 1;
            Ok(true)
        }
        _ => {
            report.committed += 1;
            report.committed_tokens += slots.len();
            debug!(node = %id, slots = slots.len(), "Prefetch committed");
            cache.set_value(id, Some(slots))?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::evictor::EvictionStrategy;
    use crate::cache::node::Residency;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::pool::kv_pool::{KvPool, TieredSlotPool};
    use crate::transfer::lane::LaneWorker;

    fn setup(device_slots: usize) -> (PrefixCache, LaneWorker) {
        let (pool, worker) = TieredSlotPool::new(&PoolConfig {
            device_slots,
            host_slots: 16,
            slot_bytes: 4,
        });
        let cache = PrefixCache::new(
            &CacheConfig {
                eviction_policy: EvictionStrategy::Lru,
                demote_on_evict: false,
            },
            Box::new(pool),
        );
        (cache, worker)
    }

    fn host_node(cache: &mut PrefixCache, tokens: &[u32]) -> NodeId {
        let host = cache.pool_mut().reserve_host(tokens.len()).unwrap();
        cache.insert_host(tokens, &host).unwrap().last_node
    }

    fn engine(max_in_flight: usize) -> PrefetchEngine {
        PrefetchEngine::new(&PrefetchConfig {
            max_in_flight,
            ..Default::default()
        })
    }

    #[test]
    fn test_prefetch_commits_on_tick() {
        let (mut cache, mut worker) = setup(8);
        let node = host_node(&mut cache, &[1, 2, 3]);
        let mut engine = engine(0);

        assert_eq!(engine.request_prefetch(&mut cache, node).unwrap(), PrefetchOutcome::Started);
        assert_eq!(cache.node(node).unwrap().residency(), Residency::Prefetching);
        assert_eq!(cache.total_size(), 0);

        // Not a hit while in flight.
        let m = cache.match_prefix(&[1, 2, 3]).unwrap();
        assert_eq!(m.matched_len(), 0);
        assert_eq!(m.host_hit_len, 0);

        let report = engine.tick(&mut cache).unwrap();
        assert_eq!(report.pending, 1);

        worker.drain();
        let report = engine.tick(&mut cache).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.committed_tokens, 3);
        assert!(engine.in_flight().is_empty());
        assert_eq!(cache.total_size(), 3);
        assert_eq!(cache.evictable_size(), 3);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_no_op_outcomes() {
        let (mut cache, _worker) = setup(8);
        let mut engine = engine(0);

        let slots = cache.pool_mut().reserve(2).unwrap();
        let resident = cache.insert(&[7, 8], &slots).unwrap().last_node;
        assert_eq!(
            engine.request_prefetch(&mut cache, resident).unwrap(),
            PrefetchOutcome::AlreadyResident
        );

        let node = host_node(&mut cache, &[1, 2]);
        engine.request_prefetch(&mut cache, node).unwrap();
        let available = cache.pool().available();
        assert_eq!(
            engine.request_prefetch(&mut cache, node).unwrap(),
            PrefetchOutcome::AlreadyPrefetching
        );
        assert_eq!(cache.pool().available(), available);
        assert_eq!(engine.stats().started, 1);
    }

    #[test]
    fn test_reservation_failure_changes_nothing() {
        let (mut cache, _worker) = setup(2);
        let node = host_node(&mut cache, &[1, 2, 3]);
        let mut engine = engine(0);

        let outcome = engine.request_prefetch(&mut cache, node).unwrap();
        assert!(matches!(outcome, PrefetchOutcome::ReservationFailed(AllocError::OutOfSlots { .. })));

        let n = cache.node(node).unwrap();
        assert!(!n.is_prefetching());
        assert!(n.value().is_none());
        assert_eq!(n.host_value().map(<[_]>::len), Some(3));
        assert_eq!(cache.pool().available(), 2);
    }

    #[test]
    fn test_failed_transfer_releases_reservation() {
        let (mut cache, worker) = setup(8);
        drop(worker);
        let node = host_node(&mut cache, &[1, 2]);
        let mut engine = engine(0);

        engine.request_prefetch(&mut cache, node).unwrap();
        assert_eq!(cache.pool().available(), 6);

        let report = engine.tick(&mut cache).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(cache.pool().available(), 8);
        assert_eq!(cache.node(node).unwrap().residency(), Residency::HostResident);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_broken_prefetch_does_not_stall_others() {
        let (mut cache, mut worker) = setup(8);
        let a = host_node(&mut cache, &[1, 2]);
        let b = host_node(&mut cache, &[3]);
        let mut engine = engine(0);

        engine.request_prefetch(&mut cache, a).unwrap();
        engine.request_prefetch(&mut cache, b).unwrap();
        worker.drain();
        cache.get_mut(b).unwrap().completion_handle = None;

        let err = engine.tick(&mut cache).unwrap_err();
        assert!(matches!(err, CacheError::InvariantViolation(_)));
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.stats().committed, 1);
        assert_eq!(cache.node(a).unwrap().residency(), Residency::DeviceResident);
        assert_eq!(cache.node(b).unwrap().residency(), Residency::HostResident);
        assert_eq!(cache.pool().available(), 6);
        cache.check_invariants().unwrap();

        assert_eq!(engine.tick(&mut cache).unwrap(), TickReport::default());
    }

    #[test]
    fn test_cancel_defers_release_until_settled() {
        let (mut cache, mut worker) = setup(8);
        let node = host_node(&mut cache, &[1, 2]);
        let mut engine = engine(0);

        engine.request_prefetch(&mut cache, node).unwrap();
        assert!(engine.cancel(&mut cache, node).unwrap());
        assert!(!engine.cancel(&mut cache, node).unwrap());
        assert_eq!(cache.node(node).unwrap().residency(), Residency::HostResident);

        // Lane still owns the slots.
        assert_eq!(engine.tick(&mut cache).unwrap().drained_slots, 0);
        assert_eq!(engine.draining_slots(), 2);
        assert_eq!(cache.pool().available(), 6);

        worker.drain();
        let report = engine.tick(&mut cache).unwrap();
        assert_eq!(report.drained_slots, 2);
        assert_eq!(report.committed, 0);
        assert_eq!(cache.pool().available(), 8);
        assert!(cache.node(node).unwrap().value().is_none());
    }

    #[test]
    fn test_throttle_and_path_stops() {
        let (mut cache, _worker) = setup(16);
        let a = host_node(&mut cache, &[1]);
        let b = host_node(&mut cache, &[2]);
        let c = host_node(&mut cache, &[3]);
        let mut engine = engine(2);

        let outcomes = engine.request_prefetch_path(&mut cache, &[a, b, c]).unwrap();
        assert_eq!(
            outcomes,
            vec![PrefetchOutcome::Started, PrefetchOutcome::Started, PrefetchOutcome::Throttled]
        );
        assert_eq!(engine.in_flight().len(), 2);
        assert_eq!(engine.stats().throttled, 1);
    }

    #[test]
    fn test_stale_node_is_error() {
        let (mut cache, _worker) = setup(8);
        let mut engine = engine(0);
        let slots = cache.pool_mut().reserve(1).unwrap();
        let node = cache.insert(&[1], &slots).unwrap().last_node;
        cache.evict(1).unwrap();

        assert_eq!(
            engine.request_prefetch(&mut cache, node),
            Err(CacheError::UnknownNode(node))
        );
    }
}
