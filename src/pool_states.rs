//! # Pool State Store
//!
//! In-memory registry of the latest known state per liquidity pool.
//!
//! ## Discipline
//! - Single writer (the feed intake path), many readers.
//! - Entries are replaced wholesale from a `PoolUpdate`, never merged.
//! - Readers scan over an owned snapshot; a scan in flight never observes a
//!   half-applied update.
//!
//! ## Ordering
//! Duplicate delivery of the same (block, timestamp) is idempotent, and an
//! update strictly older than the stored entry (by block, then timestamp) is
//! ignored rather than regressing reserves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use crate::config::StoreSettings;
use crate::types::{PoolState, PoolUpdate};

//================================================================================================//
//                                             TYPES                                              //
//================================================================================================//

/// Lookup and update counters, cumulative since construction.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub tracked_pools: u64,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub updates_applied: u64,
    pub updates_ignored: u64,
}

impl StoreStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookup_hits + self.lookup_misses;
        if total == 0 {
            return 0.0;
        }
        self.lookup_hits as f64 / total as f64
    }
}

#[derive(Debug)]
pub struct PoolStateStore {
    pools: RwLock<HashMap<Address, PoolState>>,
    staleness_secs: u64,
    lookup_hits: AtomicU64,
    lookup_misses: AtomicU64,
    updates_applied: AtomicU64,
    updates_ignored: AtomicU64,
}

//================================================================================================//
//                                         IMPLEMENTATION                                         //
//================================================================================================//

impl PoolStateStore {
    pub fn new(settings: &StoreSettings) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            staleness_secs: settings.staleness_secs,
            lookup_hits: AtomicU64::new(0),
            lookup_misses: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            updates_ignored: AtomicU64::new(0),
        })
    }

    /// Replaces the entry for the update's pool wholesale. Returns whether
    /// the update was applied; duplicates and strictly older updates are
    /// ignored.
    #[instrument(skip(self, update), level = "debug", fields(pool = %update.pool, block = update.block_number))]
    pub async fn update(&self, update: PoolUpdate) -> bool {
        let mut pools = self.pools.write().await;
        if let Some(existing) = pools.get(&update.pool) {
            let incoming = (update.block_number, update.timestamp);
            let stored = (existing.block_number, existing.last_update);
            if incoming <= stored {
                self.updates_ignored.fetch_add(1, Ordering::Relaxed);
                trace!(target: "pool_states", pool = %update.pool, "ignoring stale or duplicate update");
                return false;
            }
        }
        pools.insert(update.pool, PoolState::from(update));
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Latest state for one pool. Counts toward the hit/miss telemetry.
    pub async fn get(&self, pool: Address) -> Option<PoolState> {
        let pools = self.pools.read().await;
        match pools.get(&pool) {
            Some(state) => {
                self.lookup_hits.fetch_add(1, Ordering::Relaxed);
                Some(state.clone())
            }
            None => {
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Owned copy of every pool fresher than the staleness window. Scans
    /// iterate this copy, so concurrent updates cannot corrupt them.
    pub async fn snapshot_all(&self, now: DateTime<Utc>) -> HashMap<Address, PoolState> {
        let pools = self.pools.read().await;
        let snapshot: HashMap<Address, PoolState> = pools
            .iter()
            .filter(|(_, state)| state.age_secs(now) <= self.staleness_secs)
            .map(|(addr, state)| (*addr, state.clone()))
            .collect();
        let excluded = pools.len() - snapshot.len();
        if excluded > 0 {
            debug!(target: "pool_states", excluded, "stale pools excluded from snapshot");
        }
        snapshot
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            tracked_pools: self.pools.read().await.len() as u64,
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_ignored: self.updates_ignored.load(Ordering::Relaxed),
        }
    }
}

//================================================================================================//
//                                             TESTS                                              //
//================================================================================================//
