//! Bundle execution: takes a discovered opportunity the rest of the way.
//!
//! `BundleExecutor::execute` owns one opportunity from pre-flight to a
//! terminal [`ExecutionOutcome`]. The path is: re-validate against live pool
//! state, encode payloads, build the bundle, optionally simulate, then either
//! stop (dry run) or submit via the configured [`SubmissionMode`]. Relay modes
//! submit once and poll for inclusion; public RBF rebroadcasts the same nonce
//! at escalating gas prices. Lost races come back as `NotIncluded`, never as
//! errors.
//!
//! Every relay, broadcaster, and route-source call is wrapped in an explicit
//! timeout so a stalled collaborator cannot wedge an execution slot. During
//! shutdown, unsubmitted opportunities are rejected and submitted RBF bundles
//! stop escalating; a broadcast transaction is never abandoned mid-check.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ethers::types::Address;
use parking_lot::{Mutex, RwLock};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, Gauge, Histogram, HistogramOpts,
    IntCounter,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::amm_math;
use crate::bundle::{Bundle, PayloadEncoder};
use crate::config::{ExecutorSettings, SubmissionMode};
use crate::errors::RelayError;
use crate::pool_states::PoolStateStore;
use crate::relay::{InclusionStatus, RelayClient, TxBroadcaster};
use crate::route_source::RouteSource;
use crate::types::{ExecutionOutcome, Opportunity, PoolState, Quote, RejectReason};

//================================================================================================//
//                                           CONSTANTS                                            //
//================================================================================================//

/// Mainnet block cadence; converts the block-count inclusion wait into wall
/// time.
const SECONDS_PER_BLOCK: u64 = 12;

//================================================================================================//
//                                            METRICS                                             //
//================================================================================================//

lazy_static::lazy_static! {
    static ref BUNDLES_SUBMITTED: IntCounter = register_int_counter!(
        "bundle_executor_submitted_total",
        "Bundles that reached the submitted state at least once"
    ).unwrap();

    static ref BUNDLES_INCLUDED: IntCounter = register_int_counter!(
        "bundle_executor_included_total",
        "Bundles confirmed on-chain"
    ).unwrap();

    static ref BUNDLES_FAILED: IntCounter = register_int_counter!(
        "bundle_executor_failed_total",
        "Executions that ended in an error state"
    ).unwrap();

    static ref OPPORTUNITIES_REJECTED: IntCounter = register_int_counter!(
        "bundle_executor_rejected_total",
        "Opportunities turned away before any submission"
    ).unwrap();

    static ref RBF_REPLACEMENTS: IntCounter = register_int_counter!(
        "bundle_executor_rbf_replacements_total",
        "Replacement broadcasts at a bumped gas price"
    ).unwrap();

    static ref GAS_PRICE_GAUGE: Gauge = register_gauge!(
        "bundle_executor_gas_price_gwei",
        "Gas price of the most recent broadcast in gwei"
    ).unwrap();

    static ref EXECUTION_LATENCY: Histogram = register_histogram!(
        HistogramOpts::new(
            "bundle_executor_execution_latency_seconds",
            "End-to-end latency of one execution attempt"
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 120.0])
    ).unwrap();
}

//================================================================================================//
//                                             STATS                                              //
//================================================================================================//

/// Cumulative execution counters since construction. `submitted` counts
/// bundles that went out at least once, so rejected and dry-run bundles never
/// touch it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub included: u64,
    pub not_included: u64,
    pub expired: u64,
    pub failed: u64,
    pub total_profit: Decimal,
}

impl ExecutorStats {
    pub fn inclusion_rate(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        self.included as f64 / self.submitted as f64
    }

    pub fn avg_profit_per_included(&self) -> Decimal {
        if self.included == 0 {
            return Decimal::ZERO;
        }
        self.total_profit
            .checked_div(Decimal::from(self.included))
            .unwrap_or(Decimal::ZERO)
    }
}

//================================================================================================//
//                                        BUNDLE EXECUTOR                                         //
//================================================================================================//

/// Outcome of pre-flight re-validation: the recomputed net profit plus the
/// live pool rows, which carry the protocols used for the gas estimate.
struct Revalidation {
    net: Decimal,
    buy_pool: PoolState,
    sell_pool: PoolState,
}

pub struct BundleExecutor {
    settings: ExecutorSettings,
    store: Arc<PoolStateStore>,
    route_source: Arc<dyn RouteSource>,
    relay: Arc<dyn RelayClient>,
    broadcaster: Arc<dyn TxBroadcaster>,
    encoder: Arc<dyn PayloadEncoder>,
    history: Mutex<VecDeque<Bundle>>,
    stats: RwLock<ExecutorStats>,
    next_nonce: AtomicU64,
    shutdown: CancellationToken,
}

impl fmt::Debug for BundleExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleExecutor")
            .field("mode", &self.settings.submission_mode)
            .field("relay", &self.relay)
            .field("route_source", &self.route_source)
            .finish()
    }
}

impl BundleExecutor {
    pub fn new(
        settings: ExecutorSettings,
        store: Arc<PoolStateStore>,
        route_source: Arc<dyn RouteSource>,
        relay: Arc<dyn RelayClient>,
        broadcaster: Arc<dyn TxBroadcaster>,
        encoder: Arc<dyn PayloadEncoder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            route_source,
            relay,
            broadcaster,
            encoder,
            history: Mutex::new(VecDeque::new()),
            stats: RwLock::new(ExecutorStats::default()),
            next_nonce: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Signals shutdown. Opportunities that have not yet reached submission
    /// are rejected; a bundle already broadcast keeps its confirmation
    /// checks but is never replaced at a higher gas price again.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run one opportunity to a terminal outcome. Infallible at the type
    /// level: anything that goes wrong is folded into the returned variant.
    #[instrument(skip_all, fields(opportunity = %opportunity.id, mode = %self.settings.submission_mode))]
    pub async fn execute(&self, opportunity: Opportunity) -> ExecutionOutcome {
        let started = Instant::now();
        let outcome = self.execute_inner(&opportunity).await;
        EXECUTION_LATENCY.observe(started.elapsed().as_secs_f64());

        match &outcome {
            ExecutionOutcome::Included { block, profit, .. } => {
                BUNDLES_INCLUDED.inc();
                info!(target: "executor", block, profit = %profit, "bundle included");
            }
            ExecutionOutcome::NotIncluded { attempts, .. } => {
                info!(target: "executor", attempts, "bundle lost the inclusion race");
            }
            ExecutionOutcome::Expired { .. } => {
                info!(target: "executor", "bundle validity window elapsed");
            }
            ExecutionOutcome::Failed { reason, .. } => {
                BUNDLES_FAILED.inc();
                warn!(target: "executor", reason = %reason, "execution failed");
            }
            ExecutionOutcome::Rejected { reason } => {
                OPPORTUNITIES_REJECTED.inc();
                debug!(target: "executor", reason = %reason, "opportunity rejected pre-flight");
            }
            ExecutionOutcome::DryRun { expected_profit, .. } => {
                info!(target: "executor", expected_profit = %expected_profit, "dry run archived");
            }
        }
        outcome
    }

    async fn execute_inner(&self, opportunity: &Opportunity) -> ExecutionOutcome {
        if self.shutdown.is_cancelled() {
            return ExecutionOutcome::Rejected { reason: RejectReason::ShuttingDown };
        }

        let revalidation = match self.preflight(opportunity).await {
            Ok(r) => r,
            Err(reason) => return ExecutionOutcome::Rejected { reason },
        };

        let transactions = match self.encoder.encode(opportunity) {
            Ok(txs) => txs,
            Err(err) => {
                warn!(target: "executor", error = %err, "payload encoding failed");
                return ExecutionOutcome::Failed { bundle_id: None, reason: err.to_string() };
            }
        };

        let gas_estimate = amm_math::estimate_round_trip_gas(
            &revalidation.sell_pool.protocol,
            &revalidation.buy_pool.protocol,
        );
        let mut bundle = Bundle::new(
            opportunity.id,
            transactions,
            opportunity.block_number + self.settings.target_block_offset,
            self.settings.bundle_validity_secs,
            revalidation.net,
            gas_estimate,
            self.settings.initial_gas_price_gwei,
            Utc::now(),
        );

        if self.settings.simulate_before_submit {
            match self
                .with_timeout("simulate_bundle", self.relay.simulate_bundle(&bundle))
                .await
            {
                Ok(report) if report.success => {
                    if let Some(profit) = report.simulated_profit {
                        if profit <= Decimal::ZERO {
                            return self.fail(
                                bundle,
                                format!("simulated profit {} is not positive", profit),
                            );
                        }
                    }
                    debug!(target: "executor", gas_used = report.gas_used, "simulation passed");
                    note_transition(bundle.mark_simulated(Utc::now()));
                }
                Ok(report) => {
                    let reason = report
                        .revert_reason
                        .unwrap_or_else(|| "simulation reverted without a reason".to_string());
                    return self.fail(bundle, reason);
                }
                Err(err) => {
                    return self.fail(bundle, format!("simulation call failed: {err}"));
                }
            }
        }

        if self.settings.dry_run {
            let outcome = ExecutionOutcome::DryRun {
                bundle_id: bundle.bundle_id,
                expected_profit: bundle.expected_profit,
            };
            self.archive(bundle, &outcome);
            return outcome;
        }

        let outcome = match &self.settings.submission_mode {
            SubmissionMode::Relay | SubmissionMode::PrivateRelay { .. } => {
                self.submit_via_relay(&mut bundle, opportunity.gas_cost).await
            }
            SubmissionMode::PublicRbf => {
                self.submit_via_rbf(&mut bundle, opportunity.gas_cost).await
            }
        };
        self.archive(bundle, &outcome);
        outcome
    }

    /// Re-resolve both pools and the full round trip against live state.
    /// Quote errors and timeouts are treated as "no quote": the opportunity
    /// is rejected, not failed.
    async fn preflight(&self, opportunity: &Opportunity) -> Result<Revalidation, RejectReason> {
        let (base, intermediate) = match (
            opportunity.token_path.first(),
            opportunity.token_path.get(1),
        ) {
            (Some(b), Some(i)) => (*b, *i),
            _ => {
                warn!(target: "executor", "opportunity carries a malformed token path");
                return Err(RejectReason::NoLongerProfitable { revalidated_net: Decimal::ZERO });
            }
        };

        let buy_pool = self.store.get(opportunity.buy_pool).await;
        let sell_pool = self.store.get(opportunity.sell_pool).await;
        let (buy_pool, sell_pool) = match (buy_pool, sell_pool) {
            (Some(b), Some(s)) => (b, s),
            _ => {
                debug!(target: "executor", "pool state no longer in the store");
                return Err(RejectReason::NoLongerProfitable { revalidated_net: Decimal::ZERO });
            }
        };

        let sell_leg = match self
            .timed_quote(base, intermediate, opportunity.optimal_input)
            .await
        {
            Some(q) => q,
            None => {
                return Err(RejectReason::NoLongerProfitable { revalidated_net: Decimal::ZERO })
            }
        };
        let buy_leg = match self
            .timed_quote(intermediate, base, sell_leg.amount_out)
            .await
        {
            Some(q) => q,
            None => {
                return Err(RejectReason::NoLongerProfitable { revalidated_net: Decimal::ZERO })
            }
        };

        let net = buy_leg.amount_out
            - opportunity.optimal_input
            - opportunity.gas_cost
            - opportunity.flash_loan_fee;
        if net <= Decimal::ZERO {
            debug!(
                target: "executor",
                revalidated_net = %net,
                original_net = %opportunity.net_profit,
                "re-validation no longer clears zero"
            );
            return Err(RejectReason::NoLongerProfitable { revalidated_net: net });
        }

        Ok(Revalidation { net, buy_pool, sell_pool })
    }

    /// Submit once to the relay, then poll `check_inclusion` until the bundle
    /// lands, drops, or the wait window closes.
    async fn submit_via_relay(&self, bundle: &mut Bundle, gas_cost: Decimal) -> ExecutionOutcome {
        let ack = match self
            .with_timeout("submit_bundle", self.relay.submit_bundle(bundle))
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                let reason = format!("relay submission failed: {err}");
                note_transition(bundle.mark_failed(reason.clone(), Utc::now()));
                return ExecutionOutcome::Failed { bundle_id: Some(bundle.bundle_id), reason };
            }
        };
        note_transition(bundle.mark_submitted(Utc::now()));
        BUNDLES_SUBMITTED.inc();
        GAS_PRICE_GAUGE.set(bundle.gas_price_gwei as f64);
        debug!(
            target: "executor",
            relay = %ack.relay,
            target_block = bundle.target_block,
            "bundle accepted by relay"
        );

        let poll = Duration::from_millis(self.settings.inclusion_poll_interval_ms);
        let deadline = Instant::now() + inclusion_window(&self.settings);
        loop {
            if bundle.is_past_validity(Utc::now()) {
                note_transition(bundle.mark_expired(Utc::now()));
                return ExecutionOutcome::Expired { bundle_id: bundle.bundle_id };
            }

            match self
                .with_timeout(
                    "check_inclusion",
                    self.relay.check_inclusion(bundle.bundle_id, bundle.target_block),
                )
                .await
            {
                Ok(InclusionStatus::Included { block }) => {
                    let profit = bundle.expected_profit;
                    note_transition(bundle.mark_included(block, profit, Utc::now()));
                    return ExecutionOutcome::Included {
                        bundle_id: bundle.bundle_id,
                        block,
                        profit,
                        gas_cost,
                    };
                }
                Ok(InclusionStatus::Dropped) => {
                    note_transition(bundle.mark_not_included(Utc::now()));
                    return ExecutionOutcome::NotIncluded {
                        bundle_id: bundle.bundle_id,
                        attempts: bundle.submission_attempts,
                    };
                }
                Ok(InclusionStatus::Pending) => {}
                Err(err) => {
                    warn!(target: "executor", error = %err, "inclusion check failed, retrying");
                }
            }

            if Instant::now() >= deadline {
                note_transition(bundle.mark_not_included(Utc::now()));
                return ExecutionOutcome::NotIncluded {
                    bundle_id: bundle.bundle_id,
                    attempts: bundle.submission_attempts,
                };
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Public broadcast with replace-by-fee: same nonce, gas bumped by
    /// `gas_bump_bps` per attempt, capped at `max_gas_price_gwei`, at most
    /// `max_attempts` broadcasts of the logical transaction.
    async fn submit_via_rbf(&self, bundle: &mut Bundle, gas_cost: Decimal) -> ExecutionOutcome {
        let payload = match bundle.transactions.as_slice() {
            [single] => single.clone(),
            other => {
                let reason = format!(
                    "replace-by-fee needs a single transaction, bundle has {}",
                    other.len()
                );
                note_transition(bundle.mark_failed(reason.clone(), Utc::now()));
                return ExecutionOutcome::Failed { bundle_id: Some(bundle.bundle_id), reason };
            }
        };

        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        let check_interval = Duration::from_millis(self.settings.rbf.check_interval_ms);
        let max_attempts = self.settings.rbf.max_attempts;
        let mut gas_price = self.settings.initial_gas_price_gwei;

        for attempt in 0..max_attempts {
            if bundle.is_past_validity(Utc::now()) {
                note_transition(bundle.mark_expired(Utc::now()));
                return ExecutionOutcome::Expired { bundle_id: bundle.bundle_id };
            }

            let tx_hash = match self
                .with_timeout("broadcast", self.broadcaster.broadcast(&payload, nonce, gas_price))
                .await
            {
                Ok(hash) => hash,
                Err(err) => {
                    let reason = format!("broadcast failed: {err}");
                    note_transition(bundle.mark_failed(reason.clone(), Utc::now()));
                    return ExecutionOutcome::Failed {
                        bundle_id: Some(bundle.bundle_id),
                        reason,
                    };
                }
            };
            if attempt == 0 {
                note_transition(bundle.mark_submitted(Utc::now()));
                BUNDLES_SUBMITTED.inc();
            } else {
                note_transition(bundle.record_replacement(gas_price, Utc::now()));
                RBF_REPLACEMENTS.inc();
            }
            GAS_PRICE_GAUGE.set(gas_price as f64);
            debug!(
                target: "executor",
                attempt = attempt + 1,
                nonce,
                gas_price_gwei = gas_price,
                tx = ?tx_hash,
                "transaction broadcast"
            );

            tokio::time::sleep(check_interval).await;

            match self
                .with_timeout("confirmations", self.broadcaster.confirmations(tx_hash))
                .await
            {
                Ok(Some(confirmations)) => {
                    let profit = bundle.expected_profit;
                    note_transition(bundle.mark_included(bundle.target_block, profit, Utc::now()));
                    debug!(target: "executor", confirmations, "transaction confirmed");
                    return ExecutionOutcome::Included {
                        bundle_id: bundle.bundle_id,
                        block: bundle.target_block,
                        profit,
                        gas_cost,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "executor", error = %err, "confirmation check failed, treating as unconfirmed");
                }
            }

            if attempt + 1 < max_attempts {
                if self.shutdown.is_cancelled() {
                    debug!(target: "executor", "shutdown in progress, stopping gas escalation");
                    break;
                }
                let next = bumped_gas_price(
                    gas_price,
                    self.settings.rbf.gas_bump_bps,
                    self.settings.max_gas_price_gwei,
                );
                if next == gas_price {
                    debug!(target: "executor", gas_price_gwei = gas_price, "gas ceiling reached, stopping escalation");
                    break;
                }
                gas_price = next;
            }
        }

        note_transition(bundle.mark_not_included(Utc::now()));
        ExecutionOutcome::NotIncluded {
            bundle_id: bundle.bundle_id,
            attempts: bundle.submission_attempts,
        }
    }

    async fn timed_quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
    ) -> Option<Quote> {
        let window = Duration::from_millis(self.settings.relay_call_timeout_ms);
        match tokio::time::timeout(
            window,
            self.route_source.best_quote(token_in, token_out, amount_in),
        )
        .await
        {
            Ok(Ok(quote)) => quote,
            Ok(Err(err)) => {
                warn!(
                    target: "executor",
                    source = self.route_source.name(),
                    error = %err,
                    "quote failed during re-validation"
                );
                None
            }
            Err(_) => {
                warn!(
                    target: "executor",
                    source = self.route_source.name(),
                    timeout_ms = self.settings.relay_call_timeout_ms,
                    "quote timed out during re-validation"
                );
                None
            }
        }
    }

    async fn with_timeout<T, F>(&self, call: &'static str, fut: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        let window = Duration::from_millis(self.settings.relay_call_timeout_ms);
        match tokio::time::timeout(window, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: "executor",
                    call,
                    timeout_ms = self.settings.relay_call_timeout_ms,
                    "collaborator call timed out"
                );
                Err(RelayError::Timeout(self.settings.relay_call_timeout_ms))
            }
        }
    }

    fn fail(&self, mut bundle: Bundle, reason: String) -> ExecutionOutcome {
        note_transition(bundle.mark_failed(reason.clone(), Utc::now()));
        let outcome = ExecutionOutcome::Failed { bundle_id: Some(bundle.bundle_id), reason };
        self.archive(bundle, &outcome);
        outcome
    }

    /// Record the terminal bundle and maintain the bounded history, oldest
    /// first out.
    fn archive(&self, bundle: Bundle, outcome: &ExecutionOutcome) {
        {
            let mut stats = self.stats.write();
            if bundle.submission_attempts > 0 {
                stats.submitted += 1;
            }
            match outcome {
                ExecutionOutcome::Included { profit, .. } => {
                    stats.included += 1;
                    stats.total_profit += *profit;
                }
                ExecutionOutcome::NotIncluded { .. } => stats.not_included += 1,
                ExecutionOutcome::Expired { .. } => stats.expired += 1,
                ExecutionOutcome::Failed { .. } => stats.failed += 1,
                ExecutionOutcome::Rejected { .. } | ExecutionOutcome::DryRun { .. } => {}
            }
        }

        let mut history = self.history.lock();
        history.push_back(bundle);
        while history.len() > self.settings.bundle_history_cap {
            history.pop_front();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.read().clone()
    }

    /// Snapshot of archived bundles, oldest first.
    pub fn history(&self) -> Vec<Bundle> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

//================================================================================================//
//                                           INTERNALS                                            //
//================================================================================================//

/// The tighter of the block-count wait and the wall-clock ceiling.
fn inclusion_window(settings: &ExecutorSettings) -> Duration {
    let by_blocks = settings.inclusion_wait_blocks.saturating_mul(SECONDS_PER_BLOCK);
    Duration::from_secs(by_blocks.min(settings.inclusion_timeout_secs))
}

fn bumped_gas_price(current: u64, bump_bps: u32, ceiling: u64) -> u64 {
    let bumped = current
        .saturating_mul(10_000 + bump_bps as u64)
        / 10_000;
    bumped.min(ceiling)
}

fn note_transition(result: Result<(), &'static str>) {
    if let Err(invariant) = result {
        warn!(target: "executor", invariant, "bundle transition refused");
    }
}

//================================================================================================//
//                                             TESTS                                              //
//================================================================================================//
