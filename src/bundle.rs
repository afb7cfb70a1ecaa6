//! # Execution Bundles
//!
//! A bundle is one execution attempt: the encoded transactions, a validity
//! window, and a state machine tracking the attempt from construction to a
//! terminal outcome. Terminal states are absorbing; every transition is an
//! explicit method so an illegal edge is a programming error surfaced at
//! the call site, not a silent overwrite.

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::SubmissionError;
use crate::types::Opportunity;

//================================================================================================//
//                                        STATE MACHINE                                           //
//================================================================================================//

#[derive(Debug, Clone, PartialEq)]
pub enum BundleState {
    Created,
    Simulated,
    Submitted,
    Included { block: u64 },
    NotIncluded,
    Expired,
    Failed { reason: String },
}

impl BundleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleState::Included { .. }
                | BundleState::NotIncluded
                | BundleState::Expired
                | BundleState::Failed { .. }
        )
    }
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleState::Created => write!(f, "created"),
            BundleState::Simulated => write!(f, "simulated"),
            BundleState::Submitted => write!(f, "submitted"),
            BundleState::Included { block } => write!(f, "included@{}", block),
            BundleState::NotIncluded => write!(f, "not_included"),
            BundleState::Expired => write!(f, "expired"),
            BundleState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

//================================================================================================//
//                                            BUNDLE                                              //
//================================================================================================//

/// Content-derived bundle identifier: keccak-256 over the length-prefixed
/// transaction list. Length prefixes keep distinct lists from colliding by
/// concatenation.
pub fn compute_bundle_id(transactions: &[Bytes]) -> H256 {
    let mut preimage = Vec::with_capacity(8 + transactions.iter().map(|t| 8 + t.len()).sum::<usize>());
    preimage.extend_from_slice(&(transactions.len() as u64).to_be_bytes());
    for tx in transactions {
        preimage.extend_from_slice(&(tx.len() as u64).to_be_bytes());
        preimage.extend_from_slice(tx);
    }
    H256::from(keccak256(preimage))
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub bundle_id: H256,
    pub opportunity_id: Uuid,
    pub transactions: Vec<Bytes>,
    pub state: BundleState,
    pub target_block: u64,
    pub min_timestamp: DateTime<Utc>,
    pub max_timestamp: DateTime<Utc>,
    pub expected_profit: Decimal,
    pub actual_profit: Option<Decimal>,
    pub gas_used_estimate: u64,
    pub gas_price_gwei: u64,
    pub submission_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl Bundle {
    pub fn new(
        opportunity_id: Uuid,
        transactions: Vec<Bytes>,
        target_block: u64,
        validity_secs: u64,
        expected_profit: Decimal,
        gas_used_estimate: u64,
        gas_price_gwei: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            bundle_id: compute_bundle_id(&transactions),
            opportunity_id,
            transactions,
            state: BundleState::Created,
            target_block,
            min_timestamp: now,
            max_timestamp: now + Duration::seconds(validity_secs as i64),
            expected_profit,
            actual_profit: None,
            gas_used_estimate,
            gas_price_gwei,
            submission_attempts: 0,
            last_error: None,
            created_at: now,
            last_transition_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Validity window has passed without the bundle reaching a terminal
    /// state on its own.
    pub fn is_past_validity(&self, now: DateTime<Utc>) -> bool {
        now > self.max_timestamp
    }

    pub fn mark_simulated(&mut self, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Created => {
                self.state = BundleState::Simulated;
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("can only simulate a freshly created bundle"),
        }
    }

    /// Submission comes from `Simulated`, or straight from `Created` when
    /// pre-submit simulation is disabled.
    pub fn mark_submitted(&mut self, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Created | BundleState::Simulated => {
                self.state = BundleState::Submitted;
                self.submission_attempts += 1;
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("can only submit from created or simulated"),
        }
    }

    /// Replacement broadcast at a bumped gas price. Counts as a submission
    /// attempt of the same logical transaction.
    pub fn record_replacement(&mut self, gas_price_gwei: u64, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Submitted => {
                self.gas_price_gwei = gas_price_gwei;
                self.submission_attempts += 1;
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("can only replace a submitted bundle"),
        }
    }

    pub fn mark_included(
        &mut self,
        block: u64,
        actual_profit: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), &'static str> {
        match self.state {
            BundleState::Submitted => {
                self.state = BundleState::Included { block };
                self.actual_profit = Some(actual_profit);
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("can only include a submitted bundle"),
        }
    }

    /// Target window elapsed without confirmation. Distinct from `Failed`:
    /// the race was lost, nothing went wrong.
    pub fn mark_not_included(&mut self, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Submitted => {
                self.state = BundleState::NotIncluded;
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("can only mark a submitted bundle not included"),
        }
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Created | BundleState::Simulated | BundleState::Submitted => {
                self.state = BundleState::Expired;
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("cannot expire a terminal bundle"),
        }
    }

    pub fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), &'static str> {
        match self.state {
            BundleState::Created | BundleState::Simulated | BundleState::Submitted => {
                self.last_error = Some(reason.clone());
                self.state = BundleState::Failed { reason };
                self.last_transition_at = now;
                Ok(())
            }
            _ => Err("cannot fail a terminal bundle"),
        }
    }
}

//================================================================================================//
//                                       PAYLOAD ENCODING                                         //
//================================================================================================//

/// Builds the opaque transaction payloads a bundle carries. Signing and
/// calldata construction sit behind this seam; the engine only orders and
/// ships the resulting bytes.
pub trait PayloadEncoder: Send + Sync {
    fn encode(&self, opportunity: &Opportunity) -> Result<Vec<Bytes>, SubmissionError>;
}

#[derive(Debug, Clone, Serialize)]
struct SwapLeg {
    pool: Address,
    token_in: Address,
    token_out: Address,
    amount_in: Decimal,
}

/// Flash-loan round trip as a single self-describing payload: borrow the
/// input, sell through one pool, rebuy through the other, repay out of the
/// proceeds.
#[derive(Debug, Clone, Serialize)]
struct FlashLoanCall {
    flashloan_token: Address,
    flashloan_amount: Decimal,
    sell_leg: SwapLeg,
    buy_leg: SwapLeg,
    min_amount_out: Decimal,
    expected_profit: Decimal,
}

/// Default encoder: serializes the round trip as a JSON flash-loan call.
#[derive(Debug, Clone, Default)]
pub struct FlashLoanEncoder;

impl PayloadEncoder for FlashLoanEncoder {
    fn encode(&self, opportunity: &Opportunity) -> Result<Vec<Bytes>, SubmissionError> {
        let base = *opportunity
            .token_path
            .first()
            .ok_or_else(|| SubmissionError::Broadcast("opportunity has an empty token path".into()))?;
        let quote = *opportunity
            .token_path
            .get(1)
            .ok_or_else(|| SubmissionError::Broadcast("opportunity path has no intermediate token".into()))?;

        let call = FlashLoanCall {
            flashloan_token: base,
            flashloan_amount: opportunity.optimal_input,
            sell_leg: SwapLeg {
                pool: opportunity.sell_pool,
                token_in: base,
                token_out: quote,
                amount_in: opportunity.optimal_input,
            },
            buy_leg: SwapLeg {
                pool: opportunity.buy_pool,
                token_in: quote,
                token_out: base,
                amount_in: Decimal::ZERO,
            },
            min_amount_out: opportunity.optimal_input + opportunity.net_profit,
            expected_profit: opportunity.net_profit,
        };
        let encoded = serde_json::to_vec(&call)
            .map_err(|e| SubmissionError::Broadcast(format!("payload encoding failed: {}", e)))?;
        Ok(vec![Bytes::from(encoded)])
    }
}
