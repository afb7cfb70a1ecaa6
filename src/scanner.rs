//! # Opportunity Scanner
//!
//! Pairwise sweep over a pool snapshot producing ranked two-pool arbitrage
//! candidates. Pure with respect to engine state: the caller owns the
//! snapshot and the metrics; the scanner only computes.
//!
//! Pools are sharded by quoted token pair; within a shard every unordered
//! pool pair is evaluated once, so a cycle costs O(P²) per shard. That
//! sharding is the documented scaling bound for large pool sets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use smallvec::smallvec;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::amm_math;
use crate::config::ScannerSettings;
use crate::scorer::ConfidenceScorer;
use crate::types::{Opportunity, OpportunitySimulation, PoolState, TokenPair};

pub struct OpportunityScanner {
    settings: ScannerSettings,
    scorer: ConfidenceScorer,
}

impl OpportunityScanner {
    pub fn new(settings: ScannerSettings, scorer: ConfidenceScorer) -> Self {
        Self { settings, scorer }
    }

    /// Ranked opportunities for one snapshot: net profit descending, ties by
    /// confidence then by candidate generation order. Generation order is
    /// itself deterministic (shards and pools visited in address order), so
    /// repeated scans of one snapshot agree exactly.
    #[instrument(skip_all, fields(pools = snapshot.len()))]
    pub fn scan(
        &self,
        snapshot: &HashMap<Address, PoolState>,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let shards = shard_by_pair(snapshot);
        let mut found = Vec::new();

        for (pair, pools) in shards {
            for i in 0..pools.len() {
                for j in (i + 1)..pools.len() {
                    if let Some(opportunity) =
                        self.evaluate_pair(&pair, pools[i], pools[j], now)
                    {
                        found.push(opportunity);
                    }
                }
            }
        }

        found.sort_by(|a, b| {
            b.net_profit
                .cmp(&a.net_profit)
                .then(b.confidence_score.total_cmp(&a.confidence_score))
        });
        debug!(target: "scanner", candidates = found.len(), "scan cycle complete");
        found
    }

    /// One unordered pool pair. Orients the trade (sell into the pricier
    /// pool, rebuy through the cheaper one), sizes it, simulates both legs
    /// and applies the slippage and profitability gates.
    fn evaluate_pair(
        &self,
        pair: &TokenPair,
        first: &PoolState,
        second: &PoolState,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let (price_first, price_second) = (first.spot_price()?, second.spot_price()?);
        let (buy_pool, sell_pool) = match price_first.cmp(&price_second) {
            std::cmp::Ordering::Less => (first, second),
            std::cmp::Ordering::Greater => (second, first),
            std::cmp::Ordering::Equal => return None,
        };

        let amount_in = amm_math::optimal_input(buy_pool, sell_pool);
        if amount_in <= Decimal::ZERO {
            return None;
        }

        let simulation = self.simulate_round_trip(buy_pool, sell_pool, amount_in)?;

        if simulation.slippage_sell > self.settings.slippage_tolerance
            || simulation.slippage_buy > self.settings.slippage_tolerance
        {
            trace!(
                target: "scanner",
                buy = %buy_pool.pool,
                sell = %sell_pool.pool,
                slippage_buy = %simulation.slippage_buy,
                slippage_sell = %simulation.slippage_sell,
                "rejected on slippage tolerance"
            );
            return None;
        }
        if simulation.net_profit <= self.settings.min_profit {
            trace!(
                target: "scanner",
                buy = %buy_pool.pool,
                sell = %sell_pool.pool,
                net_profit = %simulation.net_profit,
                "rejected below profit threshold"
            );
            return None;
        }

        let confidence = self.scorer.score(&simulation, buy_pool, sell_pool, now);
        Some(Opportunity {
            id: Uuid::new_v4(),
            buy_pool: buy_pool.pool,
            sell_pool: sell_pool.pool,
            token_path: smallvec![pair.token_in, pair.token_out, pair.token_in],
            optimal_input: simulation.amount_in,
            gross_profit: simulation.gross_profit,
            gas_cost: simulation.gas_cost,
            flash_loan_fee: simulation.flash_loan_fee,
            net_profit: simulation.net_profit,
            slippage_buy: simulation.slippage_buy,
            slippage_sell: simulation.slippage_sell,
            confidence_score: confidence,
            execution_priority: (confidence * 100.0).floor() as u32,
            discovered_at: now,
            block_number: buy_pool.block_number.max(sell_pool.block_number),
        })
    }

    /// Two-leg round trip in base-token units: the input is sold forward
    /// into the sell pool, the intermediate amount swapped back through the
    /// buy pool with its reserves reversed. Either leg producing nothing
    /// kills the candidate.
    pub fn simulate_round_trip(
        &self,
        buy_pool: &PoolState,
        sell_pool: &PoolState,
        amount_in: Decimal,
    ) -> Option<OpportunitySimulation> {
        let (intermediate, slippage_sell) = amm_math::slippage(
            amount_in,
            sell_pool.reserve_in,
            sell_pool.reserve_out,
            sell_pool.fee_rate,
        );
        if intermediate <= Decimal::ZERO {
            return None;
        }

        let (final_out, slippage_buy) = amm_math::slippage(
            intermediate,
            buy_pool.reserve_out,
            buy_pool.reserve_in,
            buy_pool.fee_rate,
        );
        if final_out <= Decimal::ZERO {
            return None;
        }

        let gross_profit = final_out - amount_in;
        let flash_loan_fee = amount_in * self.settings.flash_loan_fee_rate;
        let net_profit = gross_profit - self.settings.gas_cost_estimate - flash_loan_fee;

        Some(OpportunitySimulation {
            amount_in,
            buy_amount_out: final_out,
            sell_amount_out: intermediate,
            slippage_buy,
            slippage_sell,
            gross_profit,
            gas_cost: self.settings.gas_cost_estimate,
            flash_loan_fee,
            net_profit,
        })
    }
}

/// Groups a snapshot by quoted pair, pools within each shard in address
/// order and shards visited in token-address order.
fn shard_by_pair(snapshot: &HashMap<Address, PoolState>) -> Vec<(TokenPair, Vec<&PoolState>)> {
    let mut shards: HashMap<TokenPair, Vec<&PoolState>> = HashMap::new();
    for state in snapshot.values() {
        shards.entry(state.pair).or_default().push(state);
    }
    let mut ordered: Vec<(TokenPair, Vec<&PoolState>)> = shards.into_iter().collect();
    for (_, pools) in ordered.iter_mut() {
        pools.sort_by_key(|p| p.pool);
    }
    ordered.sort_by_key(|(pair, _)| (pair.token_in, pair.token_out));
    ordered
}
