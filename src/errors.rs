//! # Centralized Error Handling
//!
//! Typed error enums for the engine's fault boundaries. Domain-expected
//! outcomes (lost inclusion races, rejected opportunities) are modeled as
//! result variants in `types`, not as errors; everything here is an actual
//! fault.

use ethers::types::H256;
use rust_decimal::Decimal;
use thiserror::Error;

/// Startup-time configuration faults. These fail fast and never reach the
/// running engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("min_profit must be positive, got {0}")]
    NonPositiveMinProfit(Decimal),
    #[error("slippage_tolerance must be in [0, 1), got {0}")]
    InvalidSlippageTolerance(Decimal),
    #[error("flash_loan_fee_rate must be in [0, 1), got {0}")]
    InvalidFlashLoanFee(Decimal),
    #[error("max_concurrent_executions must be at least 1")]
    ZeroConcurrency,
    #[error("queue_capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("bundle_history_cap must be within [100, 1000], got {0}")]
    HistoryCapOutOfRange(usize),
    #[error("rbf max_attempts must be at least 1, got {0}")]
    InvalidRbfAttempts(u32),
    #[error("rbf gas_bump_bps must be positive, got {0}")]
    InvalidRbfBump(u32),
    #[error("gas_price_gwei must be positive")]
    InvalidGasPrice,
    #[error("staleness window must be positive")]
    InvalidStalenessWindow,
    #[error("liquidity_norm must be positive, got {0}")]
    InvalidLiquidityNorm(Decimal),
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Numeric faults inside the AMM math. Caught at the math boundary; callers
/// receive sentinel zero results, never these errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
    #[error("negative radicand in {0}")]
    NegativeRadicand(&'static str),
    #[error("overflow in {0}")]
    Overflow(&'static str),
    #[error("value not representable: {0}")]
    NotRepresentable(String),
}

/// Payload-construction failures ahead of submission. Terminal for the
/// attempt; retrying requires a new bundle with a fresh id.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmissionError {
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// Quote-source boundary failures. The caller treats every variant as
/// "no quote" for the affected pair.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuoteError {
    #[error("quote source {0} timed out")]
    SourceTimeout(String),
    #[error("quote source {0} unavailable: {1}")]
    SourceUnavailable(String, String),
    #[error("invalid quote response from {0}: {1}")]
    InvalidResponse(String, String),
}

/// Relay-client boundary failures, mapped into `SubmissionError` or timeout
/// outcomes at the call sites.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("relay call timed out after {0}ms")]
    Timeout(u64),
    #[error("unknown bundle {0:?}")]
    UnknownBundle(H256),
}
