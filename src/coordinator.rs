//! Bounded-concurrency execution dispatch.
//!
//! The coordinator owns the opportunity queue and the only shared execution
//! resource: a counting semaphore capping in-flight executions. `submit` is
//! backpressured, never blocking; a full queue drops the newest submission
//! and logs it. The dispatch loop pops FIFO, applies the dispatch gates
//! (age, optional risk), then runs each opportunity on a tracked task. Every
//! task is joined on shutdown and panics are caught and counted instead of
//! vanishing with a detached handle.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CoordinatorSettings, RiskSettings};
use crate::executor::BundleExecutor;
use crate::pool_states::PoolStateStore;
use crate::risk::RiskAssessor;
use crate::types::{ExecutionOutcome, Opportunity, RejectReason};

//================================================================================================//
//                                           CONSTANTS                                            //
//================================================================================================//

/// Poll period of the dispatch loop while paused.
const PAUSE_POLL_MS: u64 = 50;

const COMPONENT_COORDINATOR: &str = "coordinator";
const COMPONENT_EXECUTOR: &str = "executor";

//================================================================================================//
//                                            METRICS                                             //
//================================================================================================//

lazy_static::lazy_static! {
    static ref OPPORTUNITIES_DISPATCHED: IntCounter = register_int_counter!(
        "coordinator_dispatched_total",
        "Opportunities handed to the executor"
    ).unwrap();

    static ref OPPORTUNITIES_DROPPED: IntCounter = register_int_counter!(
        "coordinator_dropped_total",
        "Submissions dropped because the queue was full"
    ).unwrap();

    static ref DISPATCH_REJECTED: IntCounter = register_int_counter!(
        "coordinator_dispatch_rejected_total",
        "Opportunities refused at dispatch time"
    ).unwrap();

    static ref ACTIVE_EXECUTIONS: IntGauge = register_int_gauge!(
        "coordinator_active_executions",
        "Executions currently in flight"
    ).unwrap();
}

//================================================================================================//
//                                        EXECUTOR SEAM                                           //
//================================================================================================//

/// What the coordinator needs from an executor. [`BundleExecutor`] is the
/// production implementation; tests script their own.
#[async_trait]
pub trait OpportunityExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, opportunity: Opportunity) -> ExecutionOutcome;
}

#[async_trait]
impl OpportunityExecutor for BundleExecutor {
    async fn execute(&self, opportunity: Opportunity) -> ExecutionOutcome {
        BundleExecutor::execute(self, opportunity).await
    }
}

//================================================================================================//
//                                      COMPONENT HEALTH                                          //
//================================================================================================//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Idle past the configured window with no recorded errors.
    Stale,
    /// Error rate over total operations above the configured threshold.
    Degraded,
}

#[derive(Debug, Clone)]
struct ComponentRecord {
    last_activity: Instant,
    operations: u64,
    errors: u64,
}

/// Health report row for one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub state: HealthState,
    pub idle_secs: u64,
    pub operations: u64,
    pub errors: u64,
}

/// Activity and error bookkeeping per engine component. Warn-only signals;
/// nothing here restarts anything.
#[derive(Debug, Default)]
pub struct ComponentHealthRegistry {
    components: DashMap<&'static str, ComponentRecord>,
}

impl ComponentHealthRegistry {
    pub fn record_activity(&self, component: &'static str) {
        let mut entry = self.components.entry(component).or_insert(ComponentRecord {
            last_activity: Instant::now(),
            operations: 0,
            errors: 0,
        });
        entry.last_activity = Instant::now();
        entry.operations += 1;
    }

    pub fn record_error(&self, component: &'static str) {
        let mut entry = self.components.entry(component).or_insert(ComponentRecord {
            last_activity: Instant::now(),
            operations: 0,
            errors: 0,
        });
        entry.last_activity = Instant::now();
        entry.operations += 1;
        entry.errors += 1;
    }

    /// Degraded wins over stale: a component can be both erroring and idle.
    pub fn health_of(
        &self,
        component: &str,
        stale_after: Duration,
        degraded_error_rate: f64,
        now: Instant,
    ) -> Option<HealthState> {
        let record = self.components.get(component)?;
        if record.operations > 0 {
            let rate = record.errors as f64 / record.operations as f64;
            if rate > degraded_error_rate {
                return Some(HealthState::Degraded);
            }
        }
        if now.saturating_duration_since(record.last_activity) > stale_after {
            return Some(HealthState::Stale);
        }
        Some(HealthState::Healthy)
    }

    /// Sorted by component name for a stable report.
    pub fn report(
        &self,
        stale_after: Duration,
        degraded_error_rate: f64,
        now: Instant,
    ) -> Vec<ComponentHealth> {
        let mut rows: Vec<ComponentHealth> = self
            .components
            .iter()
            .map(|entry| {
                let state = self
                    .health_of(entry.key(), stale_after, degraded_error_rate, now)
                    .unwrap_or(HealthState::Healthy);
                ComponentHealth {
                    name: entry.key().to_string(),
                    state,
                    idle_secs: now.saturating_duration_since(entry.last_activity).as_secs(),
                    operations: entry.operations,
                    errors: entry.errors,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

//================================================================================================//
//                                             STATS                                              //
//================================================================================================//

/// Rolling dispatch metrics. The moving averages start at 1.0 and decay per
/// recorded outcome with the configured factor.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub panicked: u64,
    pub total_profit: Decimal,
    pub success_rate: f64,
    pub coordination_score: f64,
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self {
            dispatched: 0,
            completed: 0,
            rejected: 0,
            dropped: 0,
            panicked: 0,
            total_profit: Decimal::ZERO,
            success_rate: 1.0,
            coordination_score: 1.0,
        }
    }
}

//================================================================================================//
//                                    EXECUTION COORDINATOR                                       //
//================================================================================================//

#[derive(Debug)]
pub struct ExecutionCoordinator {
    settings: CoordinatorSettings,
    store: Arc<PoolStateStore>,
    risk: RiskAssessor,
    executor: Arc<dyn OpportunityExecutor>,
    queue_tx: mpsc::Sender<Opportunity>,
    queue_rx: Mutex<Option<mpsc::Receiver<Opportunity>>>,
    semaphore: Arc<Semaphore>,
    active: DashMap<Uuid, Instant>,
    in_flight: AtomicUsize,
    paused: AtomicBool,
    accepting: AtomicBool,
    stats: RwLock<CoordinatorStats>,
    health: Arc<ComponentHealthRegistry>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        risk_settings: RiskSettings,
        store: Arc<PoolStateStore>,
        executor: Arc<dyn OpportunityExecutor>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity);
        let max_concurrent = settings.max_concurrent_executions;
        Arc::new(Self {
            settings,
            store,
            risk: RiskAssessor::new(risk_settings),
            executor,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            stats: RwLock::new(CoordinatorStats::default()),
            health: Arc::new(ComponentHealthRegistry::default()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            dispatch_handle: Mutex::new(None),
            health_handle: Mutex::new(None),
        })
    }

    /// Spawn the dispatch and health loops. Idempotent: a second call is a
    /// logged no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            warn!(target: "coordinator", "already started");
            return;
        };
        info!(
            target: "coordinator",
            max_concurrent = self.settings.max_concurrent_executions,
            queue_capacity = self.settings.queue_capacity,
            "coordinator starting"
        );

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            ExecutionCoordinator::dispatch_loop(coordinator, queue_rx).await;
        });
        *self.dispatch_handle.lock() = Some(handle);

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            ExecutionCoordinator::health_loop(coordinator).await;
        });
        *self.health_handle.lock() = Some(handle);
    }

    /// Enqueue for dispatch. Returns false when the submission was dropped:
    /// full queue or a coordinator that is no longer accepting. Backpressure,
    /// not an error.
    pub fn submit(&self, opportunity: Opportunity) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(target: "coordinator", opportunity = %opportunity.id, "submission refused, shutting down");
            return false;
        }
        match self.queue_tx.try_send(opportunity) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    target: "coordinator",
                    opportunity = %dropped.id,
                    net_profit = %dropped.net_profit,
                    "queue full, dropping opportunity"
                );
                OPPORTUNITIES_DROPPED.inc();
                self.stats.write().dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "coordinator", "queue closed");
                false
            }
        }
    }

    /// Stop popping the queue. Submissions still land while paused; the
    /// bounded queue provides the backpressure.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!(target: "coordinator", "dispatch paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!(target: "coordinator", "dispatch resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.read().clone()
    }

    pub fn health_registry(&self) -> Arc<ComponentHealthRegistry> {
        Arc::clone(&self.health)
    }

    pub fn health_report(&self) -> Vec<ComponentHealth> {
        self.health.report(
            Duration::from_secs(self.settings.stale_after_secs),
            self.settings.degraded_error_rate,
            Instant::now(),
        )
    }

    /// Stop intake, then wait up to the grace period for in-flight
    /// executions to reach terminal states. A submitted bundle is past the
    /// point of no return, so tasks are joined, never aborted.
    pub async fn shutdown(&self) {
        info!(target: "coordinator", "coordinator shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.tracker.close();

        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                target: "coordinator",
                in_flight = self.active_count(),
                grace_secs = self.settings.shutdown_grace_secs,
                "shutdown grace elapsed with executions still in flight"
            );
        }

        let dispatch = self.dispatch_handle.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
        let health = self.health_handle.lock().take();
        if let Some(handle) = health {
            let _ = handle.await;
        }
        info!(target: "coordinator", "coordinator stopped");
    }

    async fn dispatch_loop(
        coordinator: Arc<ExecutionCoordinator>,
        mut queue_rx: mpsc::Receiver<Opportunity>,
    ) {
        info!(target: "coordinator", "dispatch loop started");
        loop {
            if coordinator.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(PAUSE_POLL_MS)) => continue,
                }
            }

            let opportunity = tokio::select! {
                _ = coordinator.shutdown.cancelled() => break,
                received = queue_rx.recv() => match received {
                    Some(opportunity) => opportunity,
                    None => break,
                },
            };
            coordinator.health.record_activity(COMPONENT_COORDINATOR);

            if let Some(reason) = coordinator.dispatch_gate(&opportunity).await {
                DISPATCH_REJECTED.inc();
                coordinator.record_outcome(&ExecutionOutcome::Rejected { reason });
                continue;
            }

            let permit = tokio::select! {
                _ = coordinator.shutdown.cancelled() => break,
                permit = coordinator.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let id = opportunity.id;
            coordinator.active.insert(id, Instant::now());
            let in_flight = coordinator.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            ACTIVE_EXECUTIONS.set(in_flight as i64);
            OPPORTUNITIES_DISPATCHED.inc();
            coordinator.stats.write().dispatched += 1;

            let task_owner = Arc::clone(&coordinator);
            coordinator.tracker.spawn(async move {
                let executor = Arc::clone(&task_owner.executor);
                let result =
                    AssertUnwindSafe(executor.execute(opportunity)).catch_unwind().await;
                match result {
                    Ok(outcome) => task_owner.record_outcome(&outcome),
                    Err(_) => {
                        error!(target: "coordinator", opportunity = %id, "execution task panicked");
                        task_owner.stats.write().panicked += 1;
                        task_owner.health.record_error(COMPONENT_EXECUTOR);
                    }
                }
                task_owner.active.remove(&id);
                let in_flight = task_owner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                ACTIVE_EXECUTIONS.set(in_flight as i64);
                drop(permit);
            });
        }
        info!(target: "coordinator", "dispatch loop stopped");
    }

    /// Dispatch-time checks, applied after the queue wait: age limit and the
    /// optional risk gate. Returns the rejection reason, or `None` to
    /// proceed.
    async fn dispatch_gate(&self, opportunity: &Opportunity) -> Option<RejectReason> {
        let now = Utc::now();
        if opportunity.is_expired(now, self.settings.max_opportunity_age_secs) {
            let age_secs = opportunity.age_secs(now);
            warn!(
                target: "coordinator",
                opportunity = %opportunity.id,
                age_secs,
                limit = self.settings.max_opportunity_age_secs,
                "opportunity too old to dispatch"
            );
            return Some(RejectReason::StaleOpportunity { age_secs });
        }

        if self.settings.risk_gate_enabled {
            let buy_pool = self.store.get(opportunity.buy_pool).await;
            let sell_pool = self.store.get(opportunity.sell_pool).await;
            match (buy_pool, sell_pool) {
                (Some(buy), Some(sell)) => {
                    let assessment = self.risk.assess(opportunity, &buy, &sell, now);
                    if !assessment.is_safe {
                        warn!(
                            target: "coordinator",
                            opportunity = %opportunity.id,
                            risk_score = assessment.total_risk_score,
                            mitigation = assessment.mitigation.as_deref().unwrap_or("none"),
                            "risk gate refused dispatch"
                        );
                        return Some(RejectReason::RiskUnsafe {
                            score: assessment.total_risk_score,
                        });
                    }
                }
                // Missing pool state falls through: the executor's own
                // pre-flight resolves it with a typed rejection.
                _ => {
                    debug!(
                        target: "coordinator",
                        opportunity = %opportunity.id,
                        "risk gate skipped, pool state missing"
                    );
                }
            }
        }
        None
    }

    /// Fold one terminal outcome into the rolling stats. Dry runs bump the
    /// completion count and nothing else.
    fn record_outcome(&self, outcome: &ExecutionOutcome) {
        let mut stats = self.stats.write();
        stats.completed += 1;
        if matches!(outcome, ExecutionOutcome::DryRun { .. }) {
            return;
        }
        if matches!(outcome, ExecutionOutcome::Rejected { .. }) {
            stats.rejected += 1;
        }
        stats.total_profit += outcome.profit();

        let decay = self.settings.ema_decay;
        let success = if outcome.is_success() { 1.0 } else { 0.0 };
        // A lost race is mediocre coordination, not a failure.
        let quality = match outcome {
            ExecutionOutcome::Included { .. } => 1.0,
            ExecutionOutcome::NotIncluded { .. } | ExecutionOutcome::Expired { .. } => 0.5,
            _ => 0.0,
        };
        stats.success_rate = decay * stats.success_rate + (1.0 - decay) * success;
        stats.coordination_score = decay * stats.coordination_score + (1.0 - decay) * quality;
        drop(stats);

        match outcome {
            ExecutionOutcome::Failed { .. } => self.health.record_error(COMPONENT_EXECUTOR),
            _ => self.health.record_activity(COMPONENT_EXECUTOR),
        }
    }

    async fn health_loop(coordinator: Arc<ExecutionCoordinator>) {
        let mut ticker = interval(Duration::from_secs(
            coordinator.settings.health_check_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = coordinator.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for row in coordinator.health_report() {
                        match row.state {
                            HealthState::Healthy => {}
                            HealthState::Stale => warn!(
                                target: "coordinator",
                                component = %row.name,
                                idle_secs = row.idle_secs,
                                "component stale"
                            ),
                            HealthState::Degraded => warn!(
                                target: "coordinator",
                                component = %row.name,
                                errors = row.errors,
                                operations = row.operations,
                                "component degraded"
                            ),
                        }
                    }
                }
            }
        }
    }
}

//================================================================================================//
//                                             TESTS                                              //
//================================================================================================//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use crate::types::{DexProtocol, PoolUpdate, TokenPair};
    use ethers::types::{Address, H256};
    use rust_decimal_macros::dec;
    use smallvec::smallvec;
    use std::sync::atomic::AtomicUsize;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn opportunity() -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            buy_pool: addr(1),
            sell_pool: addr(2),
            token_path: smallvec![addr(100), addr(101), addr(100)],
            optimal_input: dec!(80),
            gross_profit: dec!(3),
            gas_cost: dec!(0.01),
            flash_loan_fee: dec!(0.07),
            net_profit: dec!(2.92),
            slippage_buy: dec!(0.01),
            slippage_sell: dec!(0.01),
            confidence_score: 0.5,
            execution_priority: 50,
            discovered_at: Utc::now(),
            block_number: 1,
        }
    }

    #[derive(Debug)]
    struct RecordingExecutor {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<Uuid>>,
    }

    impl RecordingExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OpportunityExecutor for RecordingExecutor {
        async fn execute(&self, opportunity: Opportunity) -> ExecutionOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().push(opportunity.id);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            ExecutionOutcome::Included {
                bundle_id: H256::zero(),
                block: 2,
                profit: dec!(1),
                gas_cost: dec!(0.01),
            }
        }
    }

    /// Panics on the first call, succeeds afterwards.
    #[derive(Debug)]
    struct FlakyExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OpportunityExecutor for FlakyExecutor {
        async fn execute(&self, _opportunity: Opportunity) -> ExecutionOutcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("scripted panic");
            }
            ExecutionOutcome::Included {
                bundle_id: H256::zero(),
                block: 2,
                profit: dec!(1),
                gas_cost: dec!(0.01),
            }
        }
    }

    fn coordinator_with(
        settings: CoordinatorSettings,
        executor: Arc<dyn OpportunityExecutor>,
    ) -> Arc<ExecutionCoordinator> {
        let store = PoolStateStore::new(&StoreSettings::default());
        ExecutionCoordinator::new(settings, RiskSettings::default(), store, executor)
    }

    async fn wait_until(label: &str, deadline_ms: u64, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while !condition() {
            assert!(
                Instant::now() < deadline,
                "timed out after {}ms waiting for {}",
                deadline_ms,
                label
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        let executor = RecordingExecutor::new(Duration::from_millis(5));
        let settings = CoordinatorSettings {
            max_concurrent_executions: 3,
            queue_capacity: 100,
            ..CoordinatorSettings::default()
        };
        let coordinator = coordinator_with(settings, executor.clone());
        coordinator.start();

        for _ in 0..100 {
            assert!(coordinator.submit(opportunity()));
        }
        let c = coordinator.clone();
        wait_until("all executions", 20_000, move || c.stats().completed == 100).await;

        assert_eq!(executor.peak.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.active_count(), 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn dispatches_in_submission_order() {
        let executor = RecordingExecutor::new(Duration::ZERO);
        let settings = CoordinatorSettings {
            max_concurrent_executions: 1,
            queue_capacity: 20,
            ..CoordinatorSettings::default()
        };
        let coordinator = coordinator_with(settings, executor.clone());
        coordinator.start();

        let mut submitted = Vec::new();
        for _ in 0..10 {
            let opp = opportunity();
            submitted.push(opp.id);
            assert!(coordinator.submit(opp));
        }
        let c = coordinator.clone();
        wait_until("fifo drain", 5_000, move || c.stats().completed == 10).await;

        assert_eq!(*executor.seen.lock(), submitted);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_the_newest_submission() {
        let executor = RecordingExecutor::new(Duration::ZERO);
        let settings = CoordinatorSettings { queue_capacity: 10, ..CoordinatorSettings::default() };
        let coordinator = coordinator_with(settings, executor.clone());
        coordinator.pause();
        coordinator.start();

        for _ in 0..10 {
            assert!(coordinator.submit(opportunity()));
        }
        assert!(!coordinator.submit(opportunity()));
        assert_eq!(coordinator.stats().dropped, 1);

        coordinator.resume();
        let c = coordinator.clone();
        wait_until("drain after resume", 5_000, move || c.stats().completed == 10).await;
        assert_eq!(executor.seen.lock().len(), 10);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn stale_opportunities_are_rejected_at_dispatch() {
        let executor = RecordingExecutor::new(Duration::ZERO);
        let coordinator = coordinator_with(CoordinatorSettings::default(), executor.clone());
        coordinator.start();

        let mut opp = opportunity();
        opp.discovered_at = Utc::now() - chrono::Duration::seconds(20);
        assert!(coordinator.submit(opp));

        let c = coordinator.clone();
        wait_until("stale rejection", 5_000, move || c.stats().rejected == 1).await;
        assert!(executor.seen.lock().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn risk_gate_refuses_oversized_trades() {
        let executor = RecordingExecutor::new(Duration::ZERO);
        let store = PoolStateStore::new(&StoreSettings::default());
        // Imbalanced books and an input far past the exposure cap.
        store
            .update(PoolUpdate {
                pool: addr(1),
                pair: TokenPair::new(addr(100), addr(101)),
                protocol: DexProtocol::UniswapV2,
                reserve_in: dec!(1000),
                reserve_out: dec!(2500000),
                fee_rate: dec!(0.003),
                timestamp: Utc::now(),
                block_number: 1,
            })
            .await;
        store
            .update(PoolUpdate {
                pool: addr(2),
                pair: TokenPair::new(addr(100), addr(101)),
                protocol: DexProtocol::UniswapV2,
                reserve_in: dec!(100),
                reserve_out: dec!(313000),
                fee_rate: dec!(0.003),
                timestamp: Utc::now(),
                block_number: 1,
            })
            .await;
        let settings = CoordinatorSettings { risk_gate_enabled: true, ..CoordinatorSettings::default() };
        let coordinator = ExecutionCoordinator::new(
            settings,
            RiskSettings::default(),
            store,
            executor.clone(),
        );
        coordinator.start();

        let mut opp = opportunity();
        opp.optimal_input = dec!(500);
        opp.slippage_buy = dec!(0.2);
        opp.slippage_sell = dec!(0.2);
        assert!(coordinator.submit(opp));

        let c = coordinator.clone();
        wait_until("risk rejection", 5_000, move || c.stats().rejected == 1).await;
        assert!(executor.seen.lock().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_and_stops_intake() {
        let executor = RecordingExecutor::new(Duration::from_millis(50));
        let coordinator = coordinator_with(CoordinatorSettings::default(), executor.clone());
        coordinator.start();

        for _ in 0..3 {
            assert!(coordinator.submit(opportunity()));
        }
        let c = coordinator.clone();
        wait_until("executions started", 5_000, move || c.active_count() == 3).await;

        coordinator.shutdown().await;
        assert_eq!(coordinator.stats().completed, 3);
        assert_eq!(coordinator.active_count(), 0);
        assert!(!coordinator.submit(opportunity()));
    }

    #[tokio::test]
    async fn panicked_execution_is_contained() {
        let executor = Arc::new(FlakyExecutor { calls: AtomicUsize::new(0) });
        let coordinator = coordinator_with(CoordinatorSettings::default(), executor);
        coordinator.start();

        assert!(coordinator.submit(opportunity()));
        let c = coordinator.clone();
        wait_until("panic recorded", 5_000, move || c.stats().panicked == 1).await;
        assert_eq!(coordinator.active_count(), 0);

        // The coordinator keeps dispatching after a panic.
        assert!(coordinator.submit(opportunity()));
        let c = coordinator.clone();
        wait_until("next execution", 5_000, move || c.stats().completed == 1).await;
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn moving_averages_decay_per_outcome() {
        let executor = RecordingExecutor::new(Duration::ZERO);
        let coordinator = coordinator_with(CoordinatorSettings::default(), executor);

        coordinator.record_outcome(&ExecutionOutcome::Failed {
            bundle_id: None,
            reason: "scripted".to_string(),
        });
        let stats = coordinator.stats();
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
        assert!((stats.coordination_score - 0.8).abs() < 1e-9);

        coordinator.record_outcome(&ExecutionOutcome::NotIncluded {
            bundle_id: H256::zero(),
            attempts: 1,
        });
        let stats = coordinator.stats();
        assert!((stats.success_rate - 0.64).abs() < 1e-9);
        assert!((stats.coordination_score - 0.74).abs() < 1e-9);
        assert_eq!(stats.completed, 2);
    }

    #[test]
    fn health_registry_flags_stale_and_degraded() {
        let registry = ComponentHealthRegistry::default();
        registry.record_activity("scanner");

        let stale_after = Duration::from_secs(60);
        let now = Instant::now();
        assert_eq!(
            registry.health_of("scanner", stale_after, 0.5, now),
            Some(HealthState::Healthy)
        );
        assert_eq!(
            registry.health_of("scanner", stale_after, 0.5, now + Duration::from_secs(61)),
            Some(HealthState::Stale)
        );

        registry.record_error("scanner");
        registry.record_error("scanner");
        registry.record_error("scanner");
        // 3 errors over 4 operations; degraded wins even when also idle.
        assert_eq!(
            registry.health_of("scanner", stale_after, 0.5, now + Duration::from_secs(61)),
            Some(HealthState::Degraded)
        );
        assert_eq!(registry.health_of("missing", stale_after, 0.5, now), None);
    }
}
