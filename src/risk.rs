//! # Trade Risk Assessment
//!
//! Pre-dispatch gate scoring an opportunity across four risk vectors:
//! slippage, liquidity exposure, data freshness and pool concentration.
//! Pure and synchronous; the coordinator consults it only when risk gating
//! is enabled.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::{RiskScoreWeights, RiskSettings};
use crate::types::{Opportunity, PoolState};

/// Component score above which the mitigation note names that vector.
const MITIGATION_COMPONENT_THRESHOLD: f64 = 0.8;

/// Pool age at which the freshness vector saturates.
const FRESHNESS_RISK_HORIZON_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// Normalized 0.0 (low risk) to 1.0 (high risk).
    pub total_risk_score: f64,
    pub slippage_score: f64,
    pub liquidity_score: f64,
    pub freshness_score: f64,
    pub concentration_score: f64,
    pub is_safe: bool,
    pub mitigation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskAssessor {
    settings: RiskSettings,
}

impl RiskAssessor {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    /// Scores one opportunity against the pools it would trade through.
    /// Both pools must be the live store entries, not the scan-time
    /// snapshot, or the freshness vector understates.
    pub fn assess(
        &self,
        opportunity: &Opportunity,
        buy_pool: &PoolState,
        sell_pool: &PoolState,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let slippage_score = slippage_risk(opportunity);
        let liquidity_score = self.liquidity_exposure_risk(opportunity, buy_pool, sell_pool);
        let freshness_score = freshness_risk(buy_pool, sell_pool, now);
        let concentration_score = concentration_risk(buy_pool, sell_pool);

        let weights = normalized(&self.settings.weights);
        let total_risk_score = (slippage_score * weights.slippage)
            + (liquidity_score * weights.liquidity)
            + (freshness_score * weights.freshness)
            + (concentration_score * weights.concentration);

        let is_safe = total_risk_score <= self.settings.max_risk_score;
        let mitigation = if is_safe {
            None
        } else {
            Some(mitigation_note(
                slippage_score,
                liquidity_score,
                freshness_score,
                concentration_score,
            ))
        };

        debug!(
            target: "risk",
            opportunity = %opportunity.id,
            total_risk_score,
            slippage_score,
            liquidity_score,
            freshness_score,
            concentration_score,
            is_safe,
            "risk assessment"
        );

        RiskAssessment {
            total_risk_score,
            slippage_score,
            liquidity_score,
            freshness_score,
            concentration_score,
            is_safe,
            mitigation,
            timestamp: now,
        }
    }

    /// Input size relative to the thinner pool, normalized by the allowed
    /// exposure fraction. Trading the full allowance scores 1.0.
    fn liquidity_exposure_risk(
        &self,
        opportunity: &Opportunity,
        buy_pool: &PoolState,
        sell_pool: &PoolState,
    ) -> f64 {
        let min_reserve = buy_pool.reserve_in.min(sell_pool.reserve_in);
        if min_reserve <= Decimal::ZERO {
            return 1.0;
        }
        let exposure = opportunity
            .optimal_input
            .checked_div(min_reserve)
            .and_then(|f| f.to_f64())
            .unwrap_or(1.0);
        let allowed = self
            .settings
            .max_exposure_fraction
            .to_f64()
            .unwrap_or(0.1)
            .max(f64::EPSILON);
        (exposure / allowed).clamp(0.0, 1.0)
    }
}

/// Average leg slippage scaled so that 5% averages saturate the vector.
fn slippage_risk(opportunity: &Opportunity) -> f64 {
    let avg = (opportunity.slippage_buy + opportunity.slippage_sell) / Decimal::TWO;
    (avg.to_f64().unwrap_or(1.0) * 20.0).clamp(0.0, 1.0)
}

fn freshness_risk(buy_pool: &PoolState, sell_pool: &PoolState, now: DateTime<Utc>) -> f64 {
    let max_age = buy_pool.age_secs(now).max(sell_pool.age_secs(now)) as f64;
    (max_age / FRESHNESS_RISK_HORIZON_SECS).clamp(0.0, 1.0)
}

/// Reserve imbalance between the two pools. Balanced books score 0; a 10x
/// imbalance scores 0.9.
fn concentration_risk(buy_pool: &PoolState, sell_pool: &PoolState) -> f64 {
    let (min, max) = if buy_pool.reserve_in <= sell_pool.reserve_in {
        (buy_pool.reserve_in, sell_pool.reserve_in)
    } else {
        (sell_pool.reserve_in, buy_pool.reserve_in)
    };
    if max <= Decimal::ZERO {
        return 1.0;
    }
    let ratio = min.checked_div(max).and_then(|r| r.to_f64()).unwrap_or(0.0);
    (1.0 - ratio).clamp(0.0, 1.0)
}

fn normalized(weights: &RiskScoreWeights) -> RiskScoreWeights {
    let total = weights.slippage + weights.liquidity + weights.freshness + weights.concentration;
    if total <= 0.0 {
        return RiskScoreWeights {
            slippage: 0.25,
            liquidity: 0.25,
            freshness: 0.25,
            concentration: 0.25,
        };
    }
    RiskScoreWeights {
        slippage: weights.slippage / total,
        liquidity: weights.liquidity / total,
        freshness: weights.freshness / total,
        concentration: weights.concentration / total,
    }
}

fn mitigation_note(
    slippage: f64,
    liquidity: f64,
    freshness: f64,
    concentration: f64,
) -> String {
    let mut notes = Vec::new();
    if slippage > MITIGATION_COMPONENT_THRESHOLD {
        notes.push("reduce trade size to cut slippage");
    }
    if liquidity > MITIGATION_COMPONENT_THRESHOLD {
        notes.push("position too large for pool depth");
    }
    if freshness > MITIGATION_COMPONENT_THRESHOLD {
        notes.push("refresh pool data before trading");
    }
    if concentration > MITIGATION_COMPONENT_THRESHOLD {
        notes.push("pool depths badly imbalanced");
    }
    if notes.is_empty() {
        "risk score exceeds threshold; consider waiting for better conditions".to_string()
    } else {
        notes.join("; ")
    }
}
