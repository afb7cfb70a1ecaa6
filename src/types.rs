//! # Core Type Definitions
//!
//! Single source of truth for the data structures shared across the engine:
//! pool snapshots, quotes, opportunities, execution outcomes and status
//! reporting. Centralizing these keeps the scanner, coordinator and executor
//! decoupled from one another.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

//================================================================================================//
//                                    DEX & PROTOCOL DEFINITIONS                                  //
//================================================================================================//

/// Constant-product venues the engine recognizes. The protocol tag only
/// influences per-swap gas estimates; the swap math is identical V2-style
/// for all of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DexProtocol {
    UniswapV2,
    SushiSwap,
    PancakeSwap,
    Other(String),
}

impl Default for DexProtocol {
    fn default() -> Self {
        DexProtocol::UniswapV2
    }
}

impl std::fmt::Display for DexProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DexProtocol::UniswapV2 => write!(f, "UniswapV2"),
            DexProtocol::SushiSwap => write!(f, "SushiSwap"),
            DexProtocol::PancakeSwap => write!(f, "PancakeSwap"),
            DexProtocol::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for DexProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uniswapv2" | "uniswap_v2" | "uniswap-v2" | "uniswap" => Ok(DexProtocol::UniswapV2),
            "sushiswap" | "sushi" => Ok(DexProtocol::SushiSwap),
            "pancakeswap" | "pancake" => Ok(DexProtocol::PancakeSwap),
            other => Ok(DexProtocol::Other(other.to_string())),
        }
    }
}

//================================================================================================//
//                                         POOL STATE                                             //
//================================================================================================//

/// Directed token pair a pool quotes: trades consume `token_in` and produce
/// `token_out`. Two pools are comparable for arbitrage only when they quote
/// the same directed pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenPair {
    pub token_in: Address,
    pub token_out: Address,
}

impl TokenPair {
    pub fn new(token_in: Address, token_out: Address) -> Self {
        Self { token_in, token_out }
    }

    /// The same pair traded in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self { token_in: self.token_out, token_out: self.token_in }
    }
}

impl std::fmt::Display for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}->{:?}", self.token_in, self.token_out)
    }
}

/// One liquidity pool snapshot. Immutable value object: feed updates replace
/// the whole entry, nothing mutates it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool: Address,
    pub pair: TokenPair,
    pub protocol: DexProtocol,
    pub reserve_in: Decimal,
    pub reserve_out: Decimal,
    /// Fee fraction in [0, 1), e.g. 0.003 for a 30 bps pool.
    pub fee_rate: Decimal,
    pub last_update: DateTime<Utc>,
    pub block_number: u64,
}

impl PoolState {
    /// A pool with either reserve at (or below) zero can no longer quote.
    pub fn is_drained(&self) -> bool {
        self.reserve_in <= Decimal::ZERO || self.reserve_out <= Decimal::ZERO
    }

    /// Marginal price `reserve_out / reserve_in`, `None` when drained.
    pub fn spot_price(&self) -> Option<Decimal> {
        if self.is_drained() {
            return None;
        }
        self.reserve_out.checked_div(self.reserve_in)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.last_update)
            .num_seconds()
            .max(0) as u64
    }
}

/// Feed-delivered pool update. The store replaces its entry wholesale from
/// one of these; duplicate delivery for the same (block, timestamp) is
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUpdate {
    pub pool: Address,
    pub pair: TokenPair,
    pub protocol: DexProtocol,
    pub reserve_in: Decimal,
    pub reserve_out: Decimal,
    pub fee_rate: Decimal,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
}

impl From<PoolUpdate> for PoolState {
    fn from(u: PoolUpdate) -> Self {
        PoolState {
            pool: u.pool,
            pair: u.pair,
            protocol: u.protocol,
            reserve_in: u.reserve_in,
            reserve_out: u.reserve_out,
            fee_rate: u.fee_rate,
            last_update: u.timestamp,
            block_number: u.block_number,
        }
    }
}

//================================================================================================//
//                                    QUOTES & OPPORTUNITIES                                      //
//================================================================================================//

/// Ordered token route; first == last for a closed arbitrage loop.
pub type TokenPath = SmallVec<[Address; 4]>;

/// Result of simulating one swap through one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub gas_estimate: u64,
    pub pool: Address,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
}

impl Quote {
    /// Effective rate `amount_out / amount_in`; zero for an empty trade.
    pub fn rate(&self) -> Decimal {
        if self.amount_in <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.amount_out.checked_div(self.amount_in).unwrap_or(Decimal::ZERO)
    }
}

/// Round-trip simulation figures for a candidate two-pool arbitrage, before
/// scoring. Produced by the scanner, consumed by the scorer and risk gate.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunitySimulation {
    pub amount_in: Decimal,
    pub buy_amount_out: Decimal,
    pub sell_amount_out: Decimal,
    pub slippage_buy: Decimal,
    pub slippage_sell: Decimal,
    pub gross_profit: Decimal,
    pub gas_cost: Decimal,
    pub flash_loan_fee: Decimal,
    pub net_profit: Decimal,
}

impl OpportunitySimulation {
    /// Net profit relative to capital in; zero for an empty trade.
    pub fn profit_margin(&self) -> Decimal {
        if self.amount_in <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.net_profit.checked_div(self.amount_in).unwrap_or(Decimal::ZERO)
    }

    pub fn avg_slippage(&self) -> Decimal {
        (self.slippage_buy + self.slippage_sell) / Decimal::TWO
    }
}

/// A ranked, profitability-filtered two-pool arbitrage candidate. Read-only
/// once created; superseded wholesale by the next scan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub id: Uuid,
    pub buy_pool: Address,
    pub sell_pool: Address,
    pub token_path: TokenPath,
    pub optimal_input: Decimal,
    pub gross_profit: Decimal,
    pub gas_cost: Decimal,
    pub flash_loan_fee: Decimal,
    pub net_profit: Decimal,
    pub slippage_buy: Decimal,
    pub slippage_sell: Decimal,
    pub confidence_score: f64,
    /// floor(confidence * 100); tie-break key only, profit ranks first.
    pub execution_priority: u32,
    pub discovered_at: DateTime<Utc>,
    pub block_number: u64,
}

impl Opportunity {
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.discovered_at)
            .num_seconds()
            .max(0) as u64
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_age_secs: u64) -> bool {
        self.age_secs(now) > max_age_secs
    }
}

impl std::fmt::Display for Opportunity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "opportunity {} buy={:?} sell={:?} in={} net={} conf={:.3}",
            self.id, self.buy_pool, self.sell_pool, self.optimal_input, self.net_profit,
            self.confidence_score
        )
    }
}

//================================================================================================//
//                                     EXECUTION OUTCOMES                                         //
//================================================================================================//

/// Why an opportunity was turned away before any bundle was built.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Older than the configured dispatch age limit.
    StaleOpportunity { age_secs: u64 },
    /// Re-validation against live pool state no longer clears the profit bar.
    NoLongerProfitable { revalidated_net: Decimal },
    /// Risk gate refused the trade.
    RiskUnsafe { score: f64 },
    /// Coordinator is shutting down and no longer accepts work.
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::StaleOpportunity { age_secs } => {
                write!(f, "stale opportunity ({}s old)", age_secs)
            }
            RejectReason::NoLongerProfitable { revalidated_net } => {
                write!(f, "no longer profitable (revalidated net {})", revalidated_net)
            }
            RejectReason::RiskUnsafe { score } => write!(f, "risk score {:.3} unsafe", score),
            RejectReason::ShuttingDown => write!(f, "engine shutting down"),
        }
    }
}

/// Tagged terminal result of one execution attempt. Lost races are outcomes,
/// not errors; callers branch on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Included { bundle_id: H256, block: u64, profit: Decimal, gas_cost: Decimal },
    NotIncluded { bundle_id: H256, attempts: u32 },
    Expired { bundle_id: H256 },
    Failed { bundle_id: Option<H256>, reason: String },
    Rejected { reason: RejectReason },
    DryRun { bundle_id: H256, expected_profit: Decimal },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Included { .. })
    }

    /// Outcomes that consumed a submission slot (a bundle actually went out).
    pub fn was_submitted(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Included { .. }
                | ExecutionOutcome::NotIncluded { .. }
                | ExecutionOutcome::Expired { .. }
        )
    }

    pub fn profit(&self) -> Decimal {
        match self {
            ExecutionOutcome::Included { profit, .. } => *profit,
            _ => Decimal::ZERO,
        }
    }
}
