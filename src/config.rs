//! # Typed Configuration
//!
//! Every tunable the engine recognizes lives in an explicit settings struct
//! with a `Default` impl; validation runs once at construction and fails
//! fast. A JSON file loader is provided for the binary; the engine itself
//! only ever reads an already-validated `EngineConfig`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ConfigError;

//================================================================================================//
//                                       Top-Level Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Scan-loop period in milliseconds.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub scorer: ScorerSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scan_interval_ms: default_scan_interval_ms(),
            store: StoreSettings::default(),
            scanner: ScannerSettings::default(),
            scorer: ScorerSettings::default(),
            risk: RiskSettings::default(),
            coordinator: CoordinatorSettings::default(),
            executor: ExecutorSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a config from a single JSON file. Missing fields
    /// fall back to their defaults.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.scanner.validate()?;
        self.scorer.validate()?;
        self.risk.validate()?;
        self.coordinator.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

//================================================================================================//
//                                     Component Settings                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Pools older than this are excluded from scan snapshots.
    pub staleness_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { staleness_secs: 30 }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staleness_secs == 0 {
            return Err(ConfigError::InvalidStalenessWindow);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Strict lower bound on net profit, in output-token units.
    pub min_profit: Decimal,
    /// Per-leg slippage tolerance as a fraction in [0, 1).
    pub slippage_tolerance: Decimal,
    /// Flat per-opportunity gas cost estimate, in output-token units.
    pub gas_cost_estimate: Decimal,
    /// Fee fraction charged on flash-borrowed input; zero means self-funded.
    pub flash_loan_fee_rate: Decimal,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            min_profit: dec!(0.01),
            slippage_tolerance: dec!(0.02),
            gas_cost_estimate: dec!(0.01),
            flash_loan_fee_rate: Decimal::ZERO,
        }
    }
}

impl ScannerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_profit <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveMinProfit(self.min_profit));
        }
        if self.slippage_tolerance < Decimal::ZERO || self.slippage_tolerance >= Decimal::ONE {
            return Err(ConfigError::InvalidSlippageTolerance(self.slippage_tolerance));
        }
        if self.flash_loan_fee_rate < Decimal::ZERO || self.flash_loan_fee_rate >= Decimal::ONE {
            return Err(ConfigError::InvalidFlashLoanFee(self.flash_loan_fee_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerSettings {
    /// Reference liquidity depth at which the liquidity factor saturates.
    pub liquidity_norm: Decimal,
    /// Confidence above which an opportunity counts as high-confidence in
    /// metrics. No behavioral effect.
    pub high_confidence_threshold: f64,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self { liquidity_norm: dec!(1000), high_confidence_threshold: 0.8 }
    }
}

impl ScorerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liquidity_norm <= Decimal::ZERO {
            return Err(ConfigError::InvalidLiquidityNorm(self.liquidity_norm));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Total risk score above which a trade is unsafe.
    pub max_risk_score: f64,
    /// Largest tolerable trade size as a fraction of the smaller reserve.
    pub max_exposure_fraction: Decimal,
    pub weights: RiskScoreWeights,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_risk_score: 0.7,
            max_exposure_fraction: dec!(0.1),
            weights: RiskScoreWeights::default(),
        }
    }
}

impl RiskSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScoreWeights {
    pub slippage: f64,
    pub liquidity: f64,
    pub freshness: f64,
    pub concentration: f64,
}

impl Default for RiskScoreWeights {
    fn default() -> Self {
        Self { slippage: 0.35, liquidity: 0.30, freshness: 0.20, concentration: 0.15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Hard cap on concurrent in-flight executions.
    pub max_concurrent_executions: usize,
    /// Bounded opportunity queue; submissions beyond capacity are dropped.
    pub queue_capacity: usize,
    /// Opportunities older than this at dispatch time are rejected.
    pub max_opportunity_age_secs: u64,
    /// When enabled, an unsafe risk assessment rejects dispatch.
    pub risk_gate_enabled: bool,
    /// Idle time after which a registered component is reported stale.
    pub stale_after_secs: u64,
    /// Error rate over total operations above which a component is degraded.
    pub degraded_error_rate: f64,
    /// Weight of the previous score in the performance EMA.
    pub ema_decay: f64,
    /// Health check loop period.
    pub health_check_interval_secs: u64,
    /// Bounded wait for in-flight executions during shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 3,
            queue_capacity: 10,
            max_opportunity_age_secs: 15,
            risk_gate_enabled: false,
            stale_after_secs: 60,
            degraded_error_rate: 0.5,
            ema_decay: 0.8,
            health_check_interval_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl CoordinatorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Where bundles go once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Default bundle relay with inclusion polling.
    Relay,
    /// Named private relay endpoint; same protocol as `Relay`.
    PrivateRelay { name: String },
    /// Public broadcast with replace-by-fee escalation.
    PublicRbf,
}

impl Default for SubmissionMode {
    fn default() -> Self {
        SubmissionMode::Relay
    }
}

impl std::fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionMode::Relay => write!(f, "relay"),
            SubmissionMode::PrivateRelay { name } => write!(f, "private_relay:{}", name),
            SubmissionMode::PublicRbf => write!(f, "public_rbf"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub submission_mode: SubmissionMode,
    /// Dry-run the bundle against chain state before any real submission.
    pub simulate_before_submit: bool,
    /// Build and simulate only; never submit.
    pub dry_run: bool,
    /// Terminal bundles kept for stats; oldest evicted beyond the cap.
    pub bundle_history_cap: usize,
    /// Blocks past the target block before a submitted bundle counts as lost.
    pub inclusion_wait_blocks: u64,
    /// Wall-clock ceiling on the inclusion wait.
    pub inclusion_timeout_secs: u64,
    pub inclusion_poll_interval_ms: u64,
    /// Explicit timeout on every relay/broadcast call.
    pub relay_call_timeout_ms: u64,
    /// Bundle validity window length (min_timestamp to max_timestamp).
    pub bundle_validity_secs: u64,
    /// Blocks ahead of the current head to target.
    pub target_block_offset: u64,
    pub initial_gas_price_gwei: u64,
    pub max_gas_price_gwei: u64,
    pub rbf: RbfSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            submission_mode: SubmissionMode::default(),
            simulate_before_submit: true,
            dry_run: false,
            bundle_history_cap: 256,
            inclusion_wait_blocks: 5,
            inclusion_timeout_secs: 60,
            inclusion_poll_interval_ms: 500,
            relay_call_timeout_ms: 5_000,
            bundle_validity_secs: 60,
            target_block_offset: 1,
            initial_gas_price_gwei: 30,
            max_gas_price_gwei: 300,
            rbf: RbfSettings::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=1000).contains(&self.bundle_history_cap) {
            return Err(ConfigError::HistoryCapOutOfRange(self.bundle_history_cap));
        }
        if self.initial_gas_price_gwei == 0 || self.max_gas_price_gwei == 0 {
            return Err(ConfigError::InvalidGasPrice);
        }
        self.rbf.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbfSettings {
    /// Total submissions for one logical transaction, the initial one
    /// included.
    pub max_attempts: u32,
    /// Gas price bump per replacement, in basis points of the previous price.
    pub gas_bump_bps: u32,
    /// Wait between confirmation checks before escalating.
    pub check_interval_ms: u64,
}

impl Default for RbfSettings {
    fn default() -> Self {
        Self { max_attempts: 3, gas_bump_bps: 1_500, check_interval_ms: 2_000 }
    }
}

impl RbfSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRbfAttempts(self.max_attempts));
        }
        if self.gas_bump_bps == 0 {
            return Err(ConfigError::InvalidRbfBump(self.gas_bump_bps));
        }
        Ok(())
    }
}
