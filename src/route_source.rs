//! # Route Sources
//!
//! A standardized interface for answering "best single-hop quote for this
//! trade". The engine's own pools answer through [`PoolRouteSource`];
//! external aggregators would sit behind the same trait. A definite absence
//! (no pool, no liquidity) is `Ok(None)`; errors are reserved for sources
//! that genuinely failed to answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use moka::future::Cache;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::amm_math;
use crate::errors::QuoteError;
use crate::pool_states::PoolStateStore;
use crate::types::{Quote, TokenPair};

/// Default TTL for cached quotes to avoid stale data.
const QUOTE_CACHE_TTL: Duration = Duration::from_secs(2);

/// Cache capacity; keys are (token_in, token_out, amount).
const QUOTE_CACHE_SIZE: u64 = 10_000;

#[async_trait]
pub trait RouteSource: Send + Sync + fmt::Debug {
    /// Best available quote for swapping `amount_in` of `token_in` into
    /// `token_out`, or `Ok(None)` when no pool can serve the trade.
    async fn best_quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
    ) -> Result<Option<Quote>, QuoteError>;

    /// Name of the source implementation.
    fn name(&self) -> &'static str;
}

//================================================================================================//
//                                    POOL-BACKED IMPLEMENTATION                                  //
//================================================================================================//

/// Answers from the engine's own pool store. A pool quoting the reversed
/// pair serves the trade with its reserves swapped.
pub struct PoolRouteSource {
    store: Arc<PoolStateStore>,
}

impl PoolRouteSource {
    pub fn new(store: Arc<PoolStateStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for PoolRouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRouteSource").finish()
    }
}

#[async_trait]
impl RouteSource for PoolRouteSource {
    #[instrument(skip(self), fields(token_in = %token_in, token_out = %token_out, amount = %amount_in))]
    async fn best_quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
    ) -> Result<Option<Quote>, QuoteError> {
        if amount_in <= Decimal::ZERO {
            return Ok(None);
        }

        let now = Utc::now();
        let requested = TokenPair::new(token_in, token_out);
        let snapshot = self.store.snapshot_all(now).await;

        // Address-sorted iteration keeps tie-breaking deterministic.
        let mut pools: Vec<_> = snapshot.values().collect();
        pools.sort_by_key(|p| p.pool);

        let mut best: Option<Quote> = None;
        for state in pools {
            let (reserve_in, reserve_out) = if state.pair == requested {
                (state.reserve_in, state.reserve_out)
            } else if state.pair == requested.reversed() {
                (state.reserve_out, state.reserve_in)
            } else {
                continue;
            };

            let amount_out = amm_math::output_for_input(
                amount_in,
                reserve_in,
                reserve_out,
                state.fee_rate,
            );
            if amount_out <= Decimal::ZERO {
                continue;
            }
            if best.as_ref().map_or(true, |b| amount_out > b.amount_out) {
                best = Some(Quote {
                    amount_in,
                    amount_out,
                    gas_estimate: amm_math::estimate_swap_gas(&state.protocol),
                    pool: state.pool,
                    timestamp: now,
                    block_number: state.block_number,
                });
            }
        }

        Ok(best)
    }

    fn name(&self) -> &'static str {
        "pool-store"
    }
}

//================================================================================================//
//                                       CACHING WRAPPER                                          //
//================================================================================================//

/// TTL cache in front of any inner source. Absences are cached as eagerly
/// as hits; errors are never cached.
pub struct CachingRouteSource {
    inner: Arc<dyn RouteSource>,
    cache: Cache<(Address, Address, Decimal), Option<Quote>>,
}

impl CachingRouteSource {
    pub fn new(inner: Arc<dyn RouteSource>) -> Self {
        Self::with_ttl(inner, QUOTE_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn RouteSource>, ttl: Duration) -> Self {
        debug!(target: "route_source", inner = inner.name(), ttl_ms = ttl.as_millis() as u64, "caching route source");
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(QUOTE_CACHE_SIZE)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl fmt::Debug for CachingRouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingRouteSource")
            .field("inner", &self.inner.name())
            .finish()
    }
}

#[async_trait]
impl RouteSource for CachingRouteSource {
    async fn best_quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
    ) -> Result<Option<Quote>, QuoteError> {
        let key = (token_in, token_out, amount_in);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let fresh = self.inner.best_quote(token_in, token_out, amount_in).await?;
        self.cache.insert(key, fresh.clone()).await;
        Ok(fresh)
    }

    fn name(&self) -> &'static str {
        "cached"
    }
}
