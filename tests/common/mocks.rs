//! Scripted relay and broadcaster doubles.
//!
//! Responses pop front-of-queue per call, so a test scripts exactly the
//! sequence it wants to exercise. An empty queue falls back to the friendly
//! default: simulations pass, submissions ack, inclusion lands at the asked
//! target block. The broadcaster's fallback confirms nothing, mirroring the
//! in-crate simulated pair, so unscripted replace-by-fee runs exhaust their
//! attempts instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use uuid::Uuid;

use arb_engine::bundle::Bundle;
use arb_engine::errors::RelayError;
use arb_engine::relay::{
    InclusionStatus, RelayClient, SimulationReport, SubmissionAck, TxBroadcaster,
};

#[derive(Debug, Default)]
pub struct ScriptedRelay {
    simulation_script: Mutex<VecDeque<Result<SimulationReport, RelayError>>>,
    submit_script: Mutex<VecDeque<RelayError>>,
    inclusion_script: Mutex<VecDeque<Result<InclusionStatus, RelayError>>>,
    submit_delay: Mutex<Option<Duration>>,
    submissions: Mutex<Vec<Uuid>>,
    simulations: AtomicU64,
    inclusion_polls: AtomicU64,
}

impl ScriptedRelay {
    pub fn script_simulation(&self, report: Result<SimulationReport, RelayError>) {
        self.simulation_script.lock().push_back(report);
    }

    pub fn script_revert(&self, reason: &str) {
        self.script_simulation(Ok(SimulationReport {
            success: false,
            gas_used: 0,
            simulated_profit: None,
            revert_reason: Some(reason.to_string()),
        }));
    }

    pub fn script_submit_failure(&self, error: RelayError) {
        self.submit_script.lock().push_back(error);
    }

    pub fn script_inclusion(&self, status: InclusionStatus) {
        self.inclusion_script.lock().push_back(Ok(status));
    }

    pub fn script_inclusion_error(&self, error: RelayError) {
        self.inclusion_script.lock().push_back(Err(error));
    }

    /// Every future submission stalls for this long before answering.
    pub fn delay_submissions(&self, delay: Duration) {
        *self.submit_delay.lock() = Some(delay);
    }

    /// Opportunity ids of accepted submissions, in arrival order.
    pub fn submitted_opportunities(&self) -> Vec<Uuid> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn simulation_count(&self) -> u64 {
        self.simulations.load(Ordering::SeqCst)
    }

    pub fn inclusion_poll_count(&self) -> u64 {
        self.inclusion_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for ScriptedRelay {
    async fn simulate_bundle(&self, bundle: &Bundle) -> Result<SimulationReport, RelayError> {
        self.simulations.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.simulation_script.lock().pop_front() {
            return scripted;
        }
        Ok(SimulationReport {
            success: true,
            gas_used: bundle.gas_used_estimate,
            simulated_profit: Some(bundle.expected_profit),
            revert_reason: None,
        })
    }

    async fn submit_bundle(&self, bundle: &Bundle) -> Result<SubmissionAck, RelayError> {
        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.submit_script.lock().pop_front() {
            return Err(error);
        }
        self.submissions.lock().push(bundle.opportunity_id);
        Ok(SubmissionAck {
            bundle_id: bundle.bundle_id,
            relay: "scripted".to_string(),
            received_at: Utc::now(),
        })
    }

    async fn check_inclusion(
        &self,
        _bundle_id: H256,
        target_block: u64,
    ) -> Result<InclusionStatus, RelayError> {
        self.inclusion_polls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.inclusion_script.lock().pop_front() {
            return scripted;
        }
        Ok(InclusionStatus::Included { block: target_block })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Debug, Default)]
pub struct ScriptedBroadcaster {
    broadcast_script: Mutex<VecDeque<RelayError>>,
    confirmation_script: Mutex<VecDeque<Result<Option<u64>, RelayError>>>,
    broadcasts: Mutex<Vec<(u64, u64)>>,
}

impl ScriptedBroadcaster {
    pub fn script_broadcast_failure(&self, error: RelayError) {
        self.broadcast_script.lock().push_back(error);
    }

    pub fn script_confirmation(&self, confirmations: Option<u64>) {
        self.confirmation_script.lock().push_back(Ok(confirmations));
    }

    pub fn script_confirmation_error(&self, error: RelayError) {
        self.confirmation_script.lock().push_back(Err(error));
    }

    /// (nonce, gas price gwei) per accepted broadcast, in call order.
    /// Scripted failures are not recorded.
    pub fn broadcasts(&self) -> Vec<(u64, u64)> {
        self.broadcasts.lock().clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

#[async_trait]
impl TxBroadcaster for ScriptedBroadcaster {
    async fn broadcast(
        &self,
        payload: &Bytes,
        nonce: u64,
        gas_price_gwei: u64,
    ) -> Result<H256, RelayError> {
        if let Some(error) = self.broadcast_script.lock().pop_front() {
            return Err(error);
        }
        self.broadcasts.lock().push((nonce, gas_price_gwei));
        let mut preimage = Vec::with_capacity(payload.len() + 16);
        preimage.extend_from_slice(payload);
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&gas_price_gwei.to_be_bytes());
        Ok(H256::from(keccak256(preimage)))
    }

    async fn confirmations(&self, _tx_hash: H256) -> Result<Option<u64>, RelayError> {
        if let Some(scripted) = self.confirmation_script.lock().pop_front() {
            return scripted;
        }
        Ok(None)
    }
}
