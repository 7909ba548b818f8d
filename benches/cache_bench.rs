//! Benchmarks for the prefix cache.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use prefix_kv_cache::cache::evictor::EvictionStrategy;
use prefix_kv_cache::cache::node::TokenId;
use prefix_kv_cache::cache::radix_tree::PrefixCache;
use prefix_kv_cache::config::{CacheConfig, PoolConfig};
use prefix_kv_cache::pool::kv_pool::{KvPool, TieredSlotPool};

const SEQUENCES: usize = 1_000;
const SEQ_LEN: usize = 64;

fn new_cache(strategy: EvictionStrategy) -> PrefixCache {
    let (pool, _worker) = TieredSlotPool::new(&PoolConfig {
        device_slots: SEQUENCES * SEQ_LEN,
        host_slots: 0,
        slot_bytes: 1,
    });
    PrefixCache::new(
        &CacheConfig {
            eviction_policy: strategy,
            demote_on_evict: false,
        },
        Box::new(pool),
    )
}

/// Sequences sharing a 16-token system prompt, then diverging.
fn workload() -> Vec<Vec<TokenId>> {
    (0..SEQUENCES)
        .map(|i| {
            let mut seq: Vec<TokenId> = (0..16).collect();
            seq.extend((0..SEQ_LEN as TokenId - 16).map(|t| i as TokenId * 1_000 + t));
            seq
        })
        .collect()
}

fn populated(strategy: EvictionStrategy, seqs: &[Vec<TokenId>]) -> PrefixCache {
    let mut cache = new_cache(strategy);
    for seq in seqs {
        let slots = cache.pool_mut().reserve(seq.len()).unwrap();
        let outcome = cache.insert(seq, &slots).unwrap();
        cache.pool_mut().release(&outcome.duplicate_slots).unwrap();
    }
    cache
}

fn bench_match(c: &mut Criterion) {
    let seqs = workload();
    let mut cache = populated(EvictionStrategy::Lru, &seqs);

    c.bench_function("match_prefix_1k_sequences", |b| {
        let mut i = 0;
        b.iter(|| {
            let m = cache.match_prefix(black_box(&seqs[i % SEQUENCES])).unwrap();
            cache.unlock(&m.matched_nodes).unwrap();
            i += 1;
            black_box(m.matched_len());
        })
    });

    c.bench_function("lookup_1k_sequences", |b| {
        let mut i = 0;
        b.iter(|| {
            black_box(cache.lookup(black_box(&seqs[i % SEQUENCES])));
            i += 1;
        })
    });
}

fn bench_insert(c: &mut Criterion) {
    let seqs = workload();

    c.bench_function("insert_1k_shared_prefix", |b| {
        b.iter_batched(
            || new_cache(EvictionStrategy::Lru),
            |mut cache| {
                for seq in &seqs {
                    let slots = cache.pool_mut().reserve(seq.len()).unwrap();
                    let outcome = cache.insert(seq, &slots).unwrap();
                    cache.pool_mut().release(&outcome.duplicate_slots).unwrap();
                }
                black_box(cache.total_size())
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_evict(c: &mut Criterion) {
    let seqs = workload();

    for strategy in [
        EvictionStrategy::Lru,
        EvictionStrategy::Lfu,
        EvictionStrategy::LeastMemoryUsage,
    ] {
        c.bench_function(&format!("evict_half_{strategy}"), |b| {
            b.iter_batched(
                || populated(strategy, &seqs),
                |mut cache| black_box(cache.evict(SEQUENCES * SEQ_LEN / 2).unwrap()),
                BatchSize::LargeInput,
            )
        });
    }
}

criterion_group!(benches, bench_match, bench_insert, bench_evict);
criterion_main!(benches);
