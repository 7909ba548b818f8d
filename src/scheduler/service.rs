//! Cache service: the single writer of the prefix cache.
//!
//! The service task owns the [`PrefixCache`] and the [`PrefetchEngine`]. All
//! other tasks talk to it through a [`CacheHandle`], which sends commands over
//! a bounded channel and awaits a oneshot reply. Between commands the service
//! ticks on a fixed interval: it commits finished prefetches, records a time
//! series snapshot and refreshes the Prometheus metrics.
//!
//! An admitted request runs the whole scheduler round trip:
//! 1. Match and lock the cached prefix
//! 2. Reserve slots for the residual, evicting under pressure
//! 3. Insert the full sequence and release the duplicate slots
//! 4. Unlock the matched path

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::evictor::EvictionStrategy;
use crate::cache::node::{NodeHints, TokenId};
use crate::cache::prefetcher::{PrefetchEngine, PrefetchOutcome, PrefetchStats, TickReport};
use crate::cache::radix_tree::{CacheError, MatchResult, PrefixCache};
use crate::config::Config;
use crate::metrics::exporter::CacheMetrics;
use crate::metrics::timeseries::{unix_now, CacheSnapshot, CacheTimeSeries};
use crate::pool::allocator::{AllocError, SlotId};
use crate::pool::kv_pool::{KvPool, TieredSlotPool};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Time series tracking is disabled")]
    HistoryDisabled,

    #[error("Cache service is not running")]
    Unavailable,
}

/// Result of admitting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmitOutcome {
    /// Tokens served from device memory.
    pub matched_tokens: usize,
    /// Tokens past the match that had a host copy.
    pub host_hit_tokens: usize,
    /// Tokens stored in new nodes.
    pub new_tokens: usize,
    /// Tokens stored into existing non-resident nodes.
    pub revived_tokens: usize,
    /// Slots reclaimed by eviction to fit this request.
    pub evicted_slots: usize,
    /// Device-resident tokens after the request.
    pub total_tokens: usize,
}

/// Result of a prefetch command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchSummary {
    pub device_hit_tokens: usize,
    pub host_hit_tokens: usize,
    /// Transfers started.
    pub started: usize,
    /// Nodes already resident or in flight.
    pub skipped: usize,
    /// Why the path stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
}

/// Live cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub strategy: EvictionStrategy,
    #[serde(flatten)]
    pub snapshot: CacheSnapshot,
    pub prefetch: PrefetchStats,
    pub prefetch_in_flight: usize,
    pub draining_slots: usize,
}

/// Commands accepted by the service.
#[derive(Debug)]
pub enum CacheCommand {
    Admit {
        tokens: Vec<TokenId>,
        hints: NodeHints,
        reply: oneshot::Sender<Result<AdmitOutcome, CacheError>>,
    },
    Prefetch {
        tokens: Vec<TokenId>,
        reply: oneshot::Sender<Result<PrefetchSummary, CacheError>>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    History {
        window_secs: Option<f64>,
        reply: oneshot::Sender<Option<Vec<CacheSnapshot>>>,
    },
}

/// Cloneable client for the service task.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CacheCommand,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ServiceError::Unavailable)?;
        rx.await.map_err(|_| ServiceError::Unavailable)
    }

    /// Admit a request's tokens into the cache.
    pub async fn admit(
        &self,
        tokens: Vec<TokenId>,
        hints: NodeHints,
    ) -> Result<AdmitOutcome, ServiceError> {
        Ok(self
            .call(|reply| CacheCommand::Admit {
                tokens,
                hints,
                reply,
            })
            .await??)
    }

    /// Start promoting the host-resident continuation of `tokens`.
    pub async fn prefetch(&self, tokens: Vec<TokenId>) -> Result<PrefetchSummary, ServiceError> {
        Ok(self
            .call(|reply| CacheCommand::Prefetch { tokens, reply })
            .await??)
    }

    pub async fn stats(&self) -> Result<CacheStats, ServiceError> {
        self.call(|reply| CacheCommand::Stats { reply }).await
    }

    /// Snapshot history within `window_secs`, or all of it.
    pub async fn history(&self, window_secs: Option<f64>) -> Result<Vec<CacheSnapshot>, ServiceError> {
        self.call(|reply| CacheCommand::History { window_secs, reply })
            .await?
            .ok_or(ServiceError::HistoryDisabled)
    }
}

/// The task that owns the cache.
pub struct CacheService {
    cache: PrefixCache,
    prefetch: PrefetchEngine,
    prefetch_enabled: bool,
    timeseries: Option<CacheTimeSeries>,
    metrics: Arc<CacheMetrics>,
    tick_interval: Duration,
    rx: mpsc::Receiver<CacheCommand>,
}

impl CacheService {
    pub fn new(
        config: &Config,
        pool: Box<dyn KvPool>,
        metrics: Arc<CacheMetrics>,
    ) -> (Self, CacheHandle) {
        let (tx, rx) = mpsc::channel(config.server.command_queue_depth.max(1));
        let service = Self {
            cache: PrefixCache::new(&config.cache, pool),
            prefetch: PrefetchEngine::new(&config.prefetch),
            prefetch_enabled: config.prefetch.enabled,
            timeseries: config
                .timeseries
                .enabled
                .then(|| CacheTimeSeries::new(&config.timeseries)),
            metrics,
            tick_interval: Duration::from_millis(config.prefetch.tick_interval_ms.max(1)),
            rx,
        };
        (service, CacheHandle { tx })
    }

    /// Build the slot pool, spawn its transfer lane and the service task.
    /// Must be called inside a tokio runtime.
    pub fn spawn(config: &Config, metrics: Arc<CacheMetrics>) -> CacheHandle {
        let (pool, worker) = TieredSlotPool::new(&config.pool);
        tokio::task::spawn_blocking(move || worker.run());

        let (service, handle) = Self::new(config, Box::new(pool), metrics);
        tokio::spawn(service.run());
        handle
    }

    pub fn cache(&self) -> &PrefixCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PrefixCache {
        &mut self.cache
    }

    pub fn prefetch_engine(&self) -> &PrefetchEngine {
        &self.prefetch
    }

    /// Serve commands and tick until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            strategy = %self.cache.strategy(),
            tick_ms = self.tick_interval.as_millis() as u64,
            prefetch = self.prefetch_enabled,
            timeseries = self.timeseries.is_some(),
            "Cache service started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        info!("Cache service stopped");
    }

    fn handle(&mut self, command: CacheCommand) {
        // A dropped receiver means the caller gave up; nothing to do.
        match command {
            CacheCommand::Admit {
                tokens,
                hints,
                reply,
            } => {
                let _ = reply.send(self.admit(&tokens, hints));
            }
            CacheCommand::Prefetch { tokens, reply } => {
                let _ = reply.send(self.prefetch_tokens(&tokens));
            }
            CacheCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            CacheCommand::History { window_secs, reply } => {
                let history = self
                    .timeseries
                    .as_ref()
                    .map(|ts| ts.history(window_secs, unix_now()));
                let _ = reply.send(history);
            }
        }
    }

    /// One scheduling iteration. Never blocks.
    pub fn tick(&mut self) -> Result<TickReport, CacheError> {
        let report = self.prefetch.tick(&mut self.cache)?;

        if let Some(ts) = self.timeseries.as_mut() {
            if let Some(snapshot) = ts.take_snapshot(&self.cache, unix_now()) {
                debug!(
                    total = snapshot.total_tokens,
                    utilization = snapshot.utilization,
                    "Recorded cache snapshot"
                );
            }
        }

        let snapshot = CacheSnapshot::capture(&self.cache, unix_now(), false);
        self.metrics
            .observe(&snapshot, &self.prefetch.stats(), self.prefetch.in_flight().len());
        Ok(report)
    }

    /// Run one request through match, reserve, insert and unlock.
    pub fn admit(&mut self, tokens: &[TokenId], hints: NodeHints) -> Result<AdmitOutcome, CacheError> {
        let matched = self.cache.match_prefix(tokens)?;
        let result = self.admit_matched(tokens, &matched, hints);
        self.cache.unlock(&matched.matched_nodes)?;

        if let Ok(outcome) = &result {
            debug!(
                tokens = tokens.len(),
                matched = outcome.matched_tokens,
                new = outcome.new_tokens,
                evicted = outcome.evicted_slots,
                "Admitted request"
            );
        }
        result
    }

    fn admit_matched(
        &mut self,
        tokens: &[TokenId],
        matched: &MatchResult,
        hints: NodeHints,
    ) -> Result<AdmitOutcome, CacheError> {
        let (fresh, evicted_slots) = self.reserve_with_eviction(matched.residual.len())?;

        let mut slots = matched.device_indices.clone();
        slots.extend_from_slice(&fresh);

        let inserted = match self.cache.insert_with(tokens, &slots, hints) {
            Ok(inserted) => inserted,
            Err(e) => {
                self.cache.pool_mut().release(&fresh)?;
                return Err(e);
            }
        };

        // The matched prefix comes back as duplicates too; those slots are the tree's own.
        let owned: HashSet<SlotId> = matched.device_indices.iter().copied().collect();
        let surplus: Vec<SlotId> = inserted
            .duplicate_slots
            .into_iter()
            .filter(|slot| !owned.contains(slot))
            .collect();
        self.cache.pool_mut().release(&surplus)?;

        Ok(AdmitOutcome {
            matched_tokens: matched.matched_len(),
            host_hit_tokens: matched.host_hit_len,
            new_tokens: inserted.new_tokens,
            revived_tokens: inserted.revived_tokens,
            evicted_slots,
            total_tokens: self.cache.total_size(),
        })
    }

    /// Reserve `count` device slots, evicting once if the pool is short.
    fn reserve_with_eviction(&mut self, count: usize) -> Result<(Vec<SlotId>, usize), CacheError> {
        if count == 0 {
            return Ok((Vec::new(), 0));
        }

        let shortfall = match self.cache.pool_mut().reserve(count) {
            Ok(slots) => return Ok((slots, 0)),
            Err(AllocError::OutOfSlots { available, .. }) => count - available,
            Err(e) => return Err(e.into()),
        };

        let freed = match self.cache.evict(shortfall) {
            Ok(freed) => freed,
            Err(CacheError::CapacityExhausted { freed, .. }) => {
                self.metrics.record_eviction(freed);
                warn!(requested = count, shortfall, freed, "Cannot fit request");
                return Err(CacheError::CapacityExhausted {
                    requested: count,
                    freed,
                });
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_eviction(freed);

        let slots = self.cache.pool_mut().reserve(count)?;
        Ok((slots, freed))
    }

    /// Start prefetching the host-resident continuation of `tokens`.
    pub fn prefetch_tokens(&mut self, tokens: &[TokenId]) -> Result<PrefetchSummary, CacheError> {
        let lookup = self.cache.lookup(tokens);
        let mut summary = PrefetchSummary {
            device_hit_tokens: lookup.device_len,
            host_hit_tokens: lookup.host_len,
            ..Default::default()
        };
        if !self.prefetch_enabled {
            summary.stopped = Some("prefetch disabled".to_string());
            return Ok(summary);
        }

        let outcomes = self
            .prefetch
            .request_prefetch_path(&mut self.cache, &lookup.host_nodes)?;
        for outcome in outcomes {
            match outcome {
                PrefetchOutcome::Started => summary.started += 1,
                PrefetchOutcome::ReservationFailed(e) => summary.stopped = Some(e.to_string()),
                PrefetchOutcome::Throttled => summary.stopped = Some("throttled".to_string()),
                _ => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            strategy: self.cache.strategy(),
            snapshot: CacheSnapshot::capture(&self.cache, unix_now(), true),
            prefetch: self.prefetch.stats(),
            prefetch_in_flight: self.prefetch.in_flight().len(),
            draining_slots: self.prefetch.draining_slots(),
        }
    }
}
