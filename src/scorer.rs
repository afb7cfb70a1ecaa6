//! # Confidence Scorer
//!
//! Multiplicative heuristic mapping a simulated round trip onto [0, 1].
//! Thin margins, heavy slippage, shallow pools and stale data each shrink
//! the score; none of the factors is a calibrated probability.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::trace;

use crate::config::ScorerSettings;
use crate::types::{OpportunitySimulation, PoolState};

/// Margin multiplier: a 10% net margin saturates the profit factor.
const MARGIN_SCALE: f64 = 10.0;

/// Slippage multiplier: 4.5% average slippage hits the factor floor.
const SLIPPAGE_SCALE: f64 = 20.0;

/// Floor applied to the slippage and freshness factors.
const FACTOR_FLOOR: f64 = 0.1;

/// Age at which the freshness factor reaches its floor.
const FRESHNESS_HORIZON_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    liquidity_norm: Decimal,
    high_confidence_threshold: f64,
}

impl ConfidenceScorer {
    pub fn new(settings: &ScorerSettings) -> Self {
        Self {
            liquidity_norm: settings.liquidity_norm,
            high_confidence_threshold: settings.high_confidence_threshold,
        }
    }

    /// Product of the margin, slippage, liquidity and freshness factors,
    /// clamped to [0, 1].
    pub fn score(
        &self,
        simulation: &OpportunitySimulation,
        buy_pool: &PoolState,
        sell_pool: &PoolState,
        now: DateTime<Utc>,
    ) -> f64 {
        let margin = simulation.profit_margin().to_f64().unwrap_or(0.0);
        let margin_factor = (margin * MARGIN_SCALE).min(1.0).max(0.0);

        let avg_slippage = simulation.avg_slippage().to_f64().unwrap_or(1.0);
        let slippage_factor = (1.0 - avg_slippage * SLIPPAGE_SCALE).max(FACTOR_FLOOR);

        let min_reserve = buy_pool.reserve_in.min(sell_pool.reserve_in);
        let liquidity_factor = min_reserve
            .checked_div(self.liquidity_norm)
            .and_then(|r| r.to_f64())
            .unwrap_or(0.0)
            .min(1.0)
            .max(0.0);

        let max_age = buy_pool.age_secs(now).max(sell_pool.age_secs(now)) as f64;
        let freshness_factor = (1.0 - max_age / FRESHNESS_HORIZON_SECS).max(FACTOR_FLOOR);

        let score = (margin_factor * slippage_factor * liquidity_factor * freshness_factor)
            .clamp(0.0, 1.0);
        trace!(
            target: "scorer",
            margin_factor,
            slippage_factor,
            liquidity_factor,
            freshness_factor,
            score,
            "confidence factors"
        );
        score
    }

    pub fn is_high_confidence(&self, score: f64) -> bool {
        score > self.high_confidence_threshold
    }
}
