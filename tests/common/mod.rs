// Shared fixtures for the integration suite: deterministic pool and
// opportunity builders plus an engine harness wired to scripted relay and
// broadcaster doubles.
//
// Pulled in by each integration test via `include!`, which cannot carry
// inner doc comments; keep this header a regular comment.

pub mod mocks;

use std::sync::Arc;

use chrono::Utc;
use ethers::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smallvec::smallvec;
use uuid::Uuid;

use arb_engine::config::EngineConfig;
use arb_engine::engine::ArbEngine;
use arb_engine::types::{DexProtocol, Opportunity, PoolUpdate, TokenPair};

use mocks::{ScriptedBroadcaster, ScriptedRelay};

pub const TOKEN_IN: u64 = 100;
pub const TOKEN_OUT: u64 = 101;

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn pair() -> TokenPair {
    TokenPair::new(addr(TOKEN_IN), addr(TOKEN_OUT))
}

/// Pool update on the standard test pair, 30 bps fee, block 1.
pub fn pool_update(pool: u64, reserve_in: Decimal, reserve_out: Decimal) -> PoolUpdate {
    pool_update_at(pool, 1, reserve_in, reserve_out)
}

pub fn pool_update_at(
    pool: u64,
    block: u64,
    reserve_in: Decimal,
    reserve_out: Decimal,
) -> PoolUpdate {
    PoolUpdate {
        pool: addr(pool),
        pair: pair(),
        protocol: DexProtocol::UniswapV2,
        reserve_in,
        reserve_out,
        fee_rate: dec!(0.003),
        timestamp: Utc::now(),
        block_number: block,
    }
}

/// The mispriced fixture used across the crate: pool 1 prices the pair at
/// 2500, pool 2 at 3131.25. The sized input is 80 and the round trip
/// returns just over 83, clearing every gate in [`test_config`].
pub fn mispriced_pools() -> (PoolUpdate, PoolUpdate) {
    (
        pool_update(1, dec!(1000), dec!(2500000)),
        pool_update(2, dec!(800), dec!(2505000)),
    )
}

/// A hand-built opportunity over the mispriced fixture, for driving the
/// executor and coordinator directly without a scan.
pub fn fixture_opportunity() -> Opportunity {
    Opportunity {
        id: Uuid::new_v4(),
        buy_pool: addr(1),
        sell_pool: addr(2),
        token_path: smallvec![addr(TOKEN_IN), addr(TOKEN_OUT), addr(TOKEN_IN)],
        optimal_input: dec!(80),
        gross_profit: dec!(3.048),
        gas_cost: dec!(0.01),
        flash_loan_fee: dec!(0.072),
        net_profit: dec!(2.966),
        slippage_buy: dec!(0.16),
        slippage_sell: dec!(0.17),
        confidence_score: 0.9,
        execution_priority: 90,
        discovered_at: Utc::now(),
        block_number: 1,
    }
}

/// Engine config tightened for tests: fast loops, a slippage tolerance wide
/// enough for the mispriced fixture, and short collaborator timeouts.
/// Submission mode and dry-run stay at their defaults; tests override what
/// they exercise.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scan_interval_ms = 10;
    config.store.staleness_secs = 300;
    config.scanner.slippage_tolerance = dec!(0.2);
    config.coordinator.max_opportunity_age_secs = 60;
    config.coordinator.queue_capacity = 64;
    config.coordinator.shutdown_grace_secs = 5;
    config.executor.inclusion_poll_interval_ms = 5;
    config.executor.relay_call_timeout_ms = 250;
    config.executor.rbf.check_interval_ms = 5;
    config
}

/// An engine wired to scripted collaborators. Not started; each test decides
/// when, and the doubles stay reachable for scripting and asserts.
pub struct TestHarness {
    pub engine: Arc<ArbEngine>,
    pub relay: Arc<ScriptedRelay>,
    pub broadcaster: Arc<ScriptedBroadcaster>,
}

impl TestHarness {
    pub fn new(config: EngineConfig) -> Self {
        let relay = Arc::new(ScriptedRelay::default());
        let broadcaster = Arc::new(ScriptedBroadcaster::default());
        let engine = ArbEngine::with_clients(config, relay.clone(), broadcaster.clone())
            .expect("test config must validate");
        Self { engine, relay, broadcaster }
    }

    /// Publish the mispriced fixture pair onto the feed. The engine must be
    /// started first or the broadcast channel has no receiver.
    pub fn feed_mispriced_pair(&self) {
        let (first, second) = mispriced_pools();
        let feed = self.engine.feed_sender();
        feed.send(first).expect("feed receiver must be alive");
        feed.send(second).expect("feed receiver must be alive");
    }
}
