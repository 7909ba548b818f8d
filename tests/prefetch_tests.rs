//! Integration tests for host-to-device prefetch.

use prefix_kv_cache::cache::node::{NodeId, Residency};
use prefix_kv_cache::cache::prefetcher::{PrefetchEngine, PrefetchOutcome};
use prefix_kv_cache::cache::radix_tree::PrefixCache;
use prefix_kv_cache::config::{CacheConfig, PoolConfig, PrefetchConfig};
use prefix_kv_cache::pool::allocator::AllocError;
use prefix_kv_cache::pool::kv_pool::{KvPool, TieredSlotPool};
use prefix_kv_cache::transfer::buffer::{lock_buffer, SharedBuffer};
use prefix_kv_cache::transfer::lane::LaneWorker;

struct Harness {
    cache: PrefixCache,
    worker: LaneWorker,
    host_buffer: SharedBuffer,
    device_buffer: SharedBuffer,
}

fn harness(device_slots: usize) -> Harness {
    let (pool, worker) = TieredSlotPool::new(&PoolConfig {
        device_slots,
        host_slots: 16,
        slot_bytes: 4,
    });
    let host_buffer = pool.host_buffer().clone();
    let device_buffer = pool.device_buffer().clone();
    let cache = PrefixCache::new(&CacheConfig::default(), Box::new(pool));
    Harness {
        cache,
        worker,
        host_buffer,
        device_buffer,
    }
}

/// Place `[1, 2]` on host slots `[5, 6]` with recognizable bytes.
fn host_prefix(h: &mut Harness) -> NodeId {
    let host = h.cache.pool_mut().reserve_host(7).unwrap();
    h.cache.pool_mut().release_host(&host[..5]).unwrap();
    assert_eq!(&host[5..], &[5, 6]);

    {
        let mut buf = lock_buffer(&h.host_buffer);
        buf.write_slot(5, &[0xA; 4]).unwrap();
        buf.write_slot(6, &[0xB; 4]).unwrap();
    }
    h.cache.insert_host(&[1, 2], &host[5..]).unwrap().last_node
}

#[test]
fn test_prefetch_commits_only_after_transfer_completes() {
    let mut h = harness(32);
    let node = host_prefix(&mut h);
    let _filler = h.cache.pool_mut().reserve(20).unwrap();
    let mut engine = PrefetchEngine::new(&PrefetchConfig::default());

    assert_eq!(
        engine.request_prefetch(&mut h.cache, node).unwrap(),
        PrefetchOutcome::Started
    );
    let n = h.cache.node(node).unwrap();
    assert_eq!(n.residency(), Residency::Prefetching);
    assert_eq!(n.pending_device_indices(), Some(&[20, 21][..]));

    // Copy not executed yet: the node stays put.
    let report = engine.tick(&mut h.cache).unwrap();
    assert_eq!(report.committed, 0);
    assert_eq!(report.pending, 1);
    assert!(h.cache.node(node).unwrap().value().is_none());
    assert_eq!(h.cache.total_size(), 0);

    assert_eq!(h.worker.drain(), 1);
    let report = engine.tick(&mut h.cache).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.committed_tokens, 2);

    let n = h.cache.node(node).unwrap();
    assert_eq!(n.value(), Some(&[20, 21][..]));
    assert!(!n.is_prefetching());
    assert_eq!(n.residency(), Residency::DeviceResident);
    assert_eq!(h.cache.total_size(), 2);
    assert!(engine.in_flight().is_empty());

    let buf = lock_buffer(&h.device_buffer);
    assert_eq!(buf.read_slot(20).unwrap(), &[0xA; 4]);
    assert_eq!(buf.read_slot(21).unwrap(), &[0xB; 4]);
    drop(buf);

    let m = h.cache.match_prefix(&[1, 2]).unwrap();
    assert_eq!(m.device_indices, vec![20, 21]);
    h.cache.unlock(&m.matched_nodes).unwrap();
    h.cache.check_invariants().unwrap();
}

#[test]
fn test_reservation_failure_leaves_node_untouched() {
    let mut h = harness(4);
    let node = host_prefix(&mut h);
    let _filler = h.cache.pool_mut().reserve(3).unwrap();
    let mut engine = PrefetchEngine::new(&PrefetchConfig::default());

    let outcome = engine.request_prefetch(&mut h.cache, node).unwrap();
    assert!(matches!(
        outcome,
        PrefetchOutcome::ReservationFailed(AllocError::OutOfSlots {
            requested: 2,
            available: 1,
            ..
        })
    ));

    let n = h.cache.node(node).unwrap();
    assert_eq!(n.residency(), Residency::HostResident);
    assert!(n.pending_device_indices().is_none());
    assert_eq!(h.cache.pool().available(), 1);
    assert_eq!(engine.stats().reservation_failures, 1);
    assert!(engine.in_flight().is_empty());
}

#[test]
fn test_repeat_requests_are_noops() {
    let mut h = harness(8);
    let node = host_prefix(&mut h);
    let mut engine = PrefetchEngine::new(&PrefetchConfig::default());

    assert!(engine.request_prefetch(&mut h.cache, node).unwrap().is_started());
    assert_eq!(
        engine.request_prefetch(&mut h.cache, node).unwrap(),
        PrefetchOutcome::AlreadyPrefetching
    );
    assert_eq!(h.cache.pool().available(), 6);

    h.worker.drain();
    engine.tick(&mut h.cache).unwrap();
    assert_eq!(
        engine.request_prefetch(&mut h.cache, node).unwrap(),
        PrefetchOutcome::AlreadyResident
    );
    assert_eq!(engine.stats().started, 1);
    assert_eq!(engine.stats().committed, 1);
}

#[test]
fn test_prefetching_node_is_never_a_hit() {
    let mut h = harness(8);
    let node = host_prefix(&mut h);
    let mut engine = PrefetchEngine::new(&PrefetchConfig::default());
    engine.request_prefetch(&mut h.cache, node).unwrap();

    let m = h.cache.match_prefix(&[1, 2, 3]).unwrap();
    assert_eq!(m.matched_len(), 0);
    assert_eq!(m.residual, vec![1, 2, 3]);
    assert_eq!(m.host_hit_len, 0);

    let probe = h.cache.lookup(&[1, 2]);
    assert_eq!(probe.device_len, 0);
    assert_eq!(probe.host_len, 0);

    // Inserting over an in-flight node hands its slots back as duplicates.
    let slots = h.cache.pool_mut().reserve(3).unwrap();
    let outcome = h.cache.insert(&[1, 2, 3], &slots).unwrap();
    assert_eq!(outcome.duplicate_slots, slots[..2].to_vec());
    assert_eq!(outcome.new_tokens, 1);
    assert!(h.cache.node(node).unwrap().value().is_none());
    h.cache.pool_mut().release(&outcome.duplicate_slots).unwrap();

    h.worker.drain();
    engine.tick(&mut h.cache).unwrap();
    let m = h.cache.match_prefix(&[1, 2, 3]).unwrap();
    assert_eq!(m.matched_len(), 3);
    h.cache.unlock(&m.matched_nodes).unwrap();
    h.cache.check_invariants().unwrap();
}

#[test]
fn test_cancel_defers_release_until_settled() {
    let mut h = harness(8);
    let node = host_prefix(&mut h);
    let mut engine = PrefetchEngine::new(&PrefetchConfig::default());
    engine.request_prefetch(&mut h.cache, node).unwrap();

    assert!(engine.cancel(&mut h.cache, node).unwrap());
    assert!(!engine.cancel(&mut h.cache, node).unwrap());
    assert_eq!(h.cache.node(node).unwrap().residency(), Residency::HostResident);
    assert_eq!(engine.draining_slots(), 2);
    // Still reserved while the lane may be writing them.
    assert_eq!(h.cache.pool().available(), 6);

    let report = engine.tick(&mut h.cache).unwrap();
    assert_eq!(report.drained_slots, 0);

    h.worker.drain();
    let report = engine.tick(&mut h.cache).unwrap();
    assert_eq!(report.drained_slots, 2);
    assert_eq!(report.committed, 0);
    assert_eq!(h.cache.pool().available(), 8);
    assert_eq!(engine.draining_slots(), 0);
    assert_eq!(engine.stats().cancelled, 1);
}

#[test]
fn test_prefetch_path_follows_match_continuation() {
    let mut h = harness(8);
    let host = h.cache.pool_mut().reserve_host(5).unwrap();
    h.cache.insert_host(&[1, 2, 3], &host[..3]).unwrap();
    h.cache.insert_host(&[1, 2, 3, 4, 5], &host).unwrap();

    let m = h.cache.match_prefix(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(m.matched_len(), 0);
    assert_eq!(m.host_hit_len, 5);
    assert_eq!(m.host_nodes.len(), 2);

    let mut engine = PrefetchEngine::new(&PrefetchConfig {
        max_in_flight: 1,
        ..Default::default()
    });
    let outcomes = engine.request_prefetch_path(&mut h.cache, &m.host_nodes).unwrap();
    assert_eq!(outcomes, vec![PrefetchOutcome::Started, PrefetchOutcome::Throttled]);
    assert_eq!(engine.stats().throttled, 1);

    h.worker.drain();
    engine.tick(&mut h.cache).unwrap();
    let outcomes = engine.request_prefetch_path(&mut h.cache, &m.host_nodes).unwrap();
    assert_eq!(outcomes, vec![PrefetchOutcome::AlreadyResident, PrefetchOutcome::Started]);

    h.worker.drain();
    engine.tick(&mut h.cache).unwrap();
    assert_eq!(h.cache.lookup(&[1, 2, 3, 4, 5]).device_len, 5);
}
