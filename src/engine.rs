//! Engine facade: the composition root the binary talks to.
//!
//! `ArbEngine` wires the pool store, scanner, coordinator and executor
//! together and runs the two long-lived loops: feed intake (a broadcast
//! receiver of [`PoolUpdate`] events feeding the store) and the periodic scan
//! (snapshot, rank, hand everything to the coordinator). Nothing here is a
//! global; every component is owned and passed by `Arc` handle.
//!
//! ## Lifecycle
//! `new` validates config and wires components, `start` spawns the loops,
//! `stop` cancels them and then drains the coordinator. An engine does not
//! restart after `stop`; build a fresh one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, HistogramOpts,
    IntCounter, IntGauge,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle::FlashLoanEncoder;
use crate::config::EngineConfig;
use crate::coordinator::{
    ComponentHealth, CoordinatorStats, ExecutionCoordinator, OpportunityExecutor,
};
use crate::errors::ConfigError;
use crate::executor::{BundleExecutor, ExecutorStats};
use crate::pool_states::{PoolStateStore, StoreStats};
use crate::relay::{RelayClient, SimulatedBroadcaster, SimulatedRelay, TxBroadcaster};
use crate::route_source::{CachingRouteSource, PoolRouteSource};
use crate::scanner::OpportunityScanner;
use crate::scorer::ConfidenceScorer;
use crate::types::PoolUpdate;

//================================================================================================//
//                                           CONSTANTS                                            //
//================================================================================================//

/// Feed fan-in buffer. A receiver that falls further behind than this loses
/// the oldest updates; the next update for the same pool repairs the gap.
const FEED_CHANNEL_CAPACITY: usize = 1024;

const COMPONENT_POOL_FEED: &str = "pool_feed";
const COMPONENT_SCANNER: &str = "scanner";

//================================================================================================//
//                                            METRICS                                             //
//================================================================================================//

lazy_static::lazy_static! {
    static ref SCAN_CYCLES: IntCounter = register_int_counter!(
        "engine_scan_cycles_total",
        "Completed scan cycles, including empty ones"
    ).unwrap();

    static ref SCAN_DURATION: Histogram = register_histogram!(
        HistogramOpts::new(
            "engine_scan_duration_seconds",
            "Wall time of one snapshot-and-scan cycle"
        )
        .buckets(vec![0.0005, 0.002, 0.01, 0.05, 0.25, 1.0])
    ).unwrap();

    static ref OPPORTUNITIES_FOUND: IntCounter = register_int_counter!(
        "engine_opportunities_found_total",
        "Opportunities that survived the scanner's profitability gates"
    ).unwrap();

    static ref HIGH_CONFIDENCE_FOUND: IntCounter = register_int_counter!(
        "engine_high_confidence_opportunities_total",
        "Found opportunities at or above the high-confidence threshold"
    ).unwrap();

    static ref POOL_UPDATES: IntCounter = register_int_counter!(
        "engine_pool_updates_total",
        "Pool updates received on the feed channel"
    ).unwrap();

    static ref POOL_UPDATES_IGNORED: IntCounter = register_int_counter!(
        "engine_pool_updates_ignored_total",
        "Feed updates dropped as duplicates or older than the stored entry"
    ).unwrap();

    static ref POOLS_TRACKED: IntGauge = register_int_gauge!(
        "engine_pools_tracked",
        "Pools currently held by the state store"
    ).unwrap();
}

//================================================================================================//
//                                            STATUS                                              //
//================================================================================================//

/// Point-in-time external view of the whole engine. Serialize-friendly so the
/// binary can log it or serve it as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub uptime_secs: u64,
    pub pools_tracked: u64,
    pub opportunities_found: u64,
    pub executions_attempted: u64,
    pub executions_succeeded: u64,
    /// Decayed moving average from the coordinator, not a lifetime ratio.
    pub success_rate: f64,
    pub total_profit: Decimal,
    pub trades_per_hour: f64,
    pub avg_profit_per_trade: Decimal,
    pub active_executions: usize,
    pub store: StoreStats,
    pub coordinator: CoordinatorStats,
    pub executor: ExecutorStats,
    pub health: Vec<ComponentHealth>,
}

//================================================================================================//
//                                            ENGINE                                              //
//================================================================================================//

pub struct ArbEngine {
    config: EngineConfig,
    store: Arc<PoolStateStore>,
    scanner: OpportunityScanner,
    scorer: ConfidenceScorer,
    coordinator: Arc<ExecutionCoordinator>,
    executor: Arc<BundleExecutor>,
    feed_tx: broadcast::Sender<PoolUpdate>,
    opportunities_found: AtomicU64,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    shutdown: CancellationToken,
    feed_handle: Mutex<Option<JoinHandle<()>>>,
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ArbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbEngine")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("scan_interval_ms", &self.config.scan_interval_ms)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl ArbEngine {
    /// Wires an engine against the simulated relay and broadcaster, which
    /// never reach a network. Production wiring injects real clients through
    /// [`ArbEngine::with_clients`].
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_clients(config, Arc::new(SimulatedRelay), Arc::new(SimulatedBroadcaster))
    }

    pub fn with_clients(
        config: EngineConfig,
        relay: Arc<dyn RelayClient>,
        broadcaster: Arc<dyn TxBroadcaster>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let store = PoolStateStore::new(&config.store);
        let scorer = ConfidenceScorer::new(&config.scorer);
        let scanner = OpportunityScanner::new(config.scanner.clone(), scorer.clone());
        let route_source = Arc::new(CachingRouteSource::new(Arc::new(PoolRouteSource::new(
            Arc::clone(&store),
        ))));
        let executor = BundleExecutor::new(
            config.executor.clone(),
            Arc::clone(&store),
            route_source,
            relay,
            broadcaster,
            Arc::new(FlashLoanEncoder),
        );
        let coordinator = ExecutionCoordinator::new(
            config.coordinator.clone(),
            config.risk.clone(),
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn OpportunityExecutor>,
        );
        let (feed_tx, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            config,
            store,
            scanner,
            scorer,
            coordinator,
            executor,
            feed_tx,
            opportunities_found: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            shutdown: CancellationToken::new(),
            feed_handle: Mutex::new(None),
            scan_handle: Mutex::new(None),
        }))
    }

    /// Start the coordinator and spawn the feed-intake and scan loops.
    /// Idempotent: a second call is a logged no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(target: "engine", "already running");
            return;
        }
        *self.started_at.lock() = Some(Instant::now());
        self.coordinator.start();

        let engine = Arc::clone(self);
        let feed_rx = self.feed_tx.subscribe();
        let handle = tokio::spawn(async move {
            ArbEngine::feed_loop(engine, feed_rx).await;
        });
        *self.feed_handle.lock() = Some(handle);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            ArbEngine::scan_loop(engine).await;
        });
        *self.scan_handle.lock() = Some(handle);

        info!(
            target: "engine",
            scan_interval_ms = self.config.scan_interval_ms,
            mode = %self.config.executor.submission_mode,
            dry_run = self.config.executor.dry_run,
            "engine started"
        );
    }

    /// Handle for feed adapters to publish pool updates on. Cheap to clone.
    /// The intake loop subscribes at `start`; anything sent before that is
    /// not delivered.
    pub fn feed_sender(&self) -> broadcast::Sender<PoolUpdate> {
        self.feed_tx.clone()
    }

    /// Halt dispatch while intake and scans keep running. Queued work waits;
    /// mid-flight executions are unaffected.
    pub fn pause(&self) {
        self.coordinator.pause();
    }

    pub fn resume(&self) {
        self.coordinator.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.coordinator.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> EngineStatus {
        let started = *self.started_at.lock();
        let uptime_secs = started.map(|at| at.elapsed().as_secs()).unwrap_or(0);
        let store = self.store.stats().await;
        let coordinator = self.coordinator.stats();
        let executor = self.executor.stats();

        let trades_per_hour = if uptime_secs == 0 {
            0.0
        } else {
            executor.included as f64 * 3_600.0 / uptime_secs as f64
        };

        EngineStatus {
            running: self.is_running(),
            paused: self.coordinator.is_paused(),
            uptime_secs,
            pools_tracked: store.tracked_pools,
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            executions_attempted: coordinator.dispatched,
            executions_succeeded: executor.included,
            success_rate: coordinator.success_rate,
            total_profit: executor.total_profit,
            trades_per_hour,
            avg_profit_per_trade: executor.avg_profit_per_included(),
            active_executions: self.coordinator.active_count(),
            store,
            coordinator,
            executor,
            health: self.coordinator.health_report(),
        }
    }

    /// Stop the loops, then drain the coordinator: intake closes first, then
    /// in-flight executions get the configured grace to reach terminal
    /// states. Only the first call does the work.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "engine", "engine stopping");
        self.shutdown.cancel();

        let feed = self.feed_handle.lock().take();
        if let Some(handle) = feed {
            let _ = handle.await;
        }
        let scan = self.scan_handle.lock().take();
        if let Some(handle) = scan {
            let _ = handle.await;
        }

        self.executor.begin_shutdown();
        self.coordinator.shutdown().await;
        info!(target: "engine", "engine stopped");
    }

    /// Applies feed updates to the store until shutdown. Lag on the channel
    /// loses updates rather than blocking the publisher; the next update for
    /// an affected pool repairs it.
    async fn feed_loop(engine: Arc<ArbEngine>, mut feed_rx: broadcast::Receiver<PoolUpdate>) {
        info!(target: "engine", "feed intake loop started");
        let health = engine.coordinator.health_registry();
        loop {
            let received = tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                received = feed_rx.recv() => received,
            };
            match received {
                Ok(update) => {
                    POOL_UPDATES.inc();
                    if engine.store.update(update).await {
                        POOLS_TRACKED.set(engine.store.len().await as i64);
                    } else {
                        POOL_UPDATES_IGNORED.inc();
                    }
                    health.record_activity(COMPONENT_POOL_FEED);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "engine", skipped, "feed receiver lagged, pool updates lost");
                    health.record_error(COMPONENT_POOL_FEED);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(target: "engine", "feed channel closed");
                    break;
                }
            }
        }
        info!(target: "engine", "feed intake loop stopped");
    }

    /// Scans the store on a fixed period and hands every ranked opportunity
    /// to the coordinator. Queue overflow is the coordinator's concern, drop
    /// and log, so a slow executor never stalls scanning.
    async fn scan_loop(engine: Arc<ArbEngine>) {
        info!(
            target: "engine",
            interval_ms = engine.config.scan_interval_ms,
            "scan loop started"
        );
        let health = engine.coordinator.health_registry();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(engine.config.scan_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            engine.scan_once().await;
            health.record_activity(COMPONENT_SCANNER);
        }
        info!(target: "engine", "scan loop stopped");
    }

    /// One cycle: snapshot, rank, submit.
    async fn scan_once(&self) {
        let started = Instant::now();
        let now = Utc::now();
        let snapshot = self.store.snapshot_all(now).await;

        let opportunities = if snapshot.is_empty() {
            Vec::new()
        } else {
            self.scanner.scan(&snapshot, now)
        };
        SCAN_CYCLES.inc();
        SCAN_DURATION.observe(started.elapsed().as_secs_f64());
        if opportunities.is_empty() {
            return;
        }

        self.opportunities_found
            .fetch_add(opportunities.len() as u64, Ordering::Relaxed);
        OPPORTUNITIES_FOUND.inc_by(opportunities.len() as u64);
        let high_confidence = opportunities
            .iter()
            .filter(|opportunity| self.scorer.is_high_confidence(opportunity.confidence_score))
            .count();
        if high_confidence > 0 {
            HIGH_CONFIDENCE_FOUND.inc_by(high_confidence as u64);
        }
        debug!(
            target: "engine",
            found = opportunities.len(),
            high_confidence,
            best_net = %opportunities[0].net_profit,
            "scan cycle found opportunities"
        );

        for opportunity in opportunities {
            self.coordinator.submit(opportunity);
        }
    }
}

//================================================================================================//
//                                             TESTS                                              //
//================================================================================================//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DexProtocol, TokenPair};
    use ethers::types::Address;
    use rust_decimal_macros::dec;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn update(pool: u64, block: u64, reserve_in: Decimal, reserve_out: Decimal) -> PoolUpdate {
        PoolUpdate {
            pool: addr(pool),
            pair: TokenPair::new(addr(100), addr(101)),
            protocol: DexProtocol::UniswapV2,
            reserve_in,
            reserve_out,
            fee_rate: dec!(0.003),
            timestamp: Utc::now(),
            block_number: block,
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scan_interval_ms = 10;
        config.store.staleness_secs = 300;
        // The fixture legs slip about 9% each; the default tolerance would
        // reject them.
        config.scanner.slippage_tolerance = dec!(0.2);
        config.executor.dry_run = true;
        config.executor.relay_call_timeout_ms = 250;
        config.coordinator.max_opportunity_age_secs = 60;
        config.coordinator.queue_capacity = 64;
        config
    }

    /// Reserves from the mispriced-pair fixture used across the crate: pool 1
    /// prices the pair at 2500, pool 2 at 3131.25, enough margin to clear
    /// every gate.
    fn feed_mispriced_pair(engine: &ArbEngine) {
        let feed = engine.feed_sender();
        feed.send(update(1, 1, dec!(1_000), dec!(2_500_000)))
            .unwrap();
        feed.send(update(2, 1, dec!(800), dec!(2_505_000))).unwrap();
    }

    async fn wait_for_completion(engine: &ArbEngine) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.status().await.coordinator.completed == 0 {
            assert!(
                Instant::now() < deadline,
                "no execution completed before the deadline"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn feed_to_dry_run_execution_round_trip() {
        let engine = ArbEngine::new(fast_config()).unwrap();
        engine.start();
        feed_mispriced_pair(&engine);

        wait_for_completion(&engine).await;

        let status = engine.status().await;
        assert!(status.running);
        assert_eq!(status.pools_tracked, 2);
        assert!(status.opportunities_found >= 1);
        assert!(status.executions_attempted >= 1);
        assert_eq!(status.executor.submitted, 0, "dry runs must never submit");
        engine.stop().await;
    }

    #[tokio::test]
    async fn status_reports_idle_engine() {
        let engine = ArbEngine::new(fast_config()).unwrap();
        engine.start();
        let feed = engine.feed_sender();
        // Equal prices: stored, scanned, nothing found.
        feed.send(update(1, 1, dec!(1_000), dec!(2_000_000)))
            .unwrap();
        feed.send(update(2, 1, dec!(500), dec!(1_000_000))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.status().await.pools_tracked < 2 {
            assert!(Instant::now() < deadline, "feed updates were not applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = engine.status().await;
        assert!(status.running);
        assert!(!status.paused);
        assert_eq!(status.opportunities_found, 0);
        assert_eq!(status.executions_attempted, 0);
        assert_eq!(status.total_profit, Decimal::ZERO);
        assert_eq!(status.trades_per_hour, 0.0);
        assert!(status.health.iter().any(|row| row.name == "pool_feed"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn older_feed_updates_are_ignored() {
        let engine = ArbEngine::new(fast_config()).unwrap();
        engine.start();
        let feed = engine.feed_sender();

        feed.send(update(1, 5, dec!(1_000), dec!(2_000_000)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.status().await.pools_tracked < 1 {
            assert!(Instant::now() < deadline, "first update was not applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        feed.send(update(1, 4, dec!(9), dec!(9))).unwrap();
        while engine.status().await.store.updates_ignored == 0 {
            assert!(Instant::now() < deadline, "older update was not ignored");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = engine.status().await;
        assert_eq!(status.pools_tracked, 1);
        assert_eq!(status.store.updates_applied, 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn pause_defers_execution_until_resume() {
        let engine = ArbEngine::new(fast_config()).unwrap();
        engine.pause();
        engine.start();
        feed_mispriced_pair(&engine);

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.status().await.opportunities_found == 0 {
            assert!(Instant::now() < deadline, "scanner found nothing while paused");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = engine.status().await;
        assert!(status.paused);
        assert_eq!(
            status.executions_attempted, 0,
            "paused dispatch must not hand work to the executor"
        );

        engine.resume();
        wait_for_completion(&engine).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_intake_and_is_idempotent() {
        let engine = ArbEngine::new(fast_config()).unwrap();
        engine.start();
        engine.start();
        assert!(engine.is_running());

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());

        let status = engine.status().await;
        assert!(!status.running);
        // Both loop receivers are gone, so the channel reports no listeners.
        assert!(engine
            .feed_sender()
            .send(update(1, 1, dec!(1), dec!(1)))
            .is_err());
    }
}
