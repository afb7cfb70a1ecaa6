//! Cross-DEX arbitrage opportunity engine.
//!
//! Pool updates stream into the [`pool_states::PoolStateStore`]; each scan
//! cycle the [`scanner::OpportunityScanner`] prices every pool pair of a
//! snapshot and emits ranked [`types::Opportunity`] values; the
//! [`coordinator::ExecutionCoordinator`] dispatches them under a hard
//! concurrency cap to the [`executor::BundleExecutor`], which drives each
//! bundle to a terminal [`types::ExecutionOutcome`]. [`engine::ArbEngine`]
//! owns the wiring and the long-lived loops; the binary talks to it alone.

pub mod amm_math;
pub mod bundle;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod pool_states;
pub mod relay;
pub mod risk;
pub mod route_source;
pub mod scanner;
pub mod scorer;
pub mod types;

pub use config::EngineConfig;
pub use engine::{ArbEngine, EngineStatus};
pub use errors::ConfigError;
pub use types::{ExecutionOutcome, Opportunity, PoolState, PoolUpdate, RejectReason};
