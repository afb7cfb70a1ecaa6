//! # Relay & Broadcast Clients
//!
//! Boundary traits for getting a bundle on-chain: private relays that accept
//! whole bundles, and the public-mempool broadcaster used for
//! replace-by-fee submission. Network implementations live behind these
//! seams; the engine ships an in-process simulated pair for dry-run
//! operation and tests.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use tracing::debug;

use crate::bundle::Bundle;
use crate::errors::RelayError;

//================================================================================================//
//                                             TYPES                                              //
//================================================================================================//

/// Relay-side dry run of a bundle against current chain state.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub success: bool,
    pub gas_used: u64,
    pub simulated_profit: Option<Decimal>,
    pub revert_reason: Option<String>,
}

/// Relay acknowledgement that a bundle was accepted for the target block.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionAck {
    pub bundle_id: H256,
    pub relay: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionStatus {
    /// Not yet seen on-chain; keep polling.
    Pending,
    Included { block: u64 },
    /// The relay dropped the bundle without inclusion.
    Dropped,
}

//================================================================================================//
//                                            TRAITS                                              //
//================================================================================================//

#[async_trait]
pub trait RelayClient: Send + Sync + fmt::Debug {
    async fn simulate_bundle(&self, bundle: &Bundle) -> Result<SimulationReport, RelayError>;

    async fn submit_bundle(&self, bundle: &Bundle) -> Result<SubmissionAck, RelayError>;

    async fn check_inclusion(
        &self,
        bundle_id: H256,
        target_block: u64,
    ) -> Result<InclusionStatus, RelayError>;

    fn name(&self) -> &'static str;
}

/// Public-mempool path for replace-by-fee submission. One logical
/// transaction per nonce; rebroadcasting the same nonce at a higher gas
/// price replaces the previous attempt.
#[async_trait]
pub trait TxBroadcaster: Send + Sync + fmt::Debug {
    async fn broadcast(
        &self,
        payload: &Bytes,
        nonce: u64,
        gas_price_gwei: u64,
    ) -> Result<H256, RelayError>;

    /// Confirmation count for a broadcast transaction, `None` while unseen.
    async fn confirmations(&self, tx_hash: H256) -> Result<Option<u64>, RelayError>;
}

//================================================================================================//
//                                     SIMULATED IMPLEMENTATIONS                                  //
//================================================================================================//

/// In-process relay that accepts everything and reports the bundle's own
/// estimates back. Lets the engine run end-to-end with no network; nothing
/// ever reaches a chain, so inclusion stays `Pending` forever.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay;

#[async_trait]
impl RelayClient for SimulatedRelay {
    async fn simulate_bundle(&self, bundle: &Bundle) -> Result<SimulationReport, RelayError> {
        Ok(SimulationReport {
            success: true,
            gas_used: bundle.gas_used_estimate,
            simulated_profit: Some(bundle.expected_profit),
            revert_reason: None,
        })
    }

    async fn submit_bundle(&self, bundle: &Bundle) -> Result<SubmissionAck, RelayError> {
        debug!(target: "relay", bundle_id = ?bundle.bundle_id, target_block = bundle.target_block, "simulated submission");
        Ok(SubmissionAck {
            bundle_id: bundle.bundle_id,
            relay: "simulated".to_string(),
            received_at: Utc::now(),
        })
    }

    async fn check_inclusion(
        &self,
        _bundle_id: H256,
        _target_block: u64,
    ) -> Result<InclusionStatus, RelayError> {
        Ok(InclusionStatus::Pending)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Broadcaster counterpart of [`SimulatedRelay`]: hashes deterministically,
/// confirms nothing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBroadcaster;

#[async_trait]
impl TxBroadcaster for SimulatedBroadcaster {
    async fn broadcast(
        &self,
        payload: &Bytes,
        nonce: u64,
        gas_price_gwei: u64,
    ) -> Result<H256, RelayError> {
        let mut preimage = Vec::with_capacity(payload.len() + 16);
        preimage.extend_from_slice(payload);
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&gas_price_gwei.to_be_bytes());
        Ok(H256::from(keccak256(preimage)))
    }

    async fn confirmations(&self, _tx_hash: H256) -> Result<Option<u64>, RelayError> {
        Ok(None)
    }
}
