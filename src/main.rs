//! Binary entry point: load config, install tracing, run the engine until
//! SIGINT.
//!
//! 1. Resolve configuration: first CLI argument as a JSON config path, else
//!    the `ARB_ENGINE_CONFIG` environment variable, else built-in defaults.
//! 2. Initialise tracing from `RUST_LOG` when set, otherwise from the
//!    config's `log_level`.
//! 3. Start the engine against the simulated relay and broadcaster (nothing
//!    reaches a network without explicit wiring) and log a status line on an
//!    interval.
//! 4. Ctrl-C: stop the engine, log the final status and a metrics dump.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use arb_engine::config::EngineConfig;
use arb_engine::engine::ArbEngine;
use arb_engine::metrics;

const STATUS_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = load_config().await?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,arb_engine={}", config.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        mode = %config.executor.submission_mode,
        dry_run = config.executor.dry_run,
        scan_interval_ms = config.scan_interval_ms,
        "starting arbitrage engine"
    );

    let engine = ArbEngine::new(config)?;
    engine.start();

    let status_engine = Arc::clone(&engine);
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = status_engine.status().await;
            info!(
                target: "engine",
                uptime_secs = status.uptime_secs,
                pools = status.pools_tracked,
                found = status.opportunities_found,
                attempted = status.executions_attempted,
                succeeded = status.executions_succeeded,
                active = status.active_executions,
                total_profit = %status.total_profit,
                "status"
            );
        }
    });

    signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");

    status_task.abort();
    engine.stop().await;

    let status = engine.status().await;
    info!(
        uptime_secs = status.uptime_secs,
        executions_attempted = status.executions_attempted,
        executions_succeeded = status.executions_succeeded,
        total_profit = %status.total_profit,
        "final status"
    );
    match metrics::render_text() {
        Ok(text) => info!(target: "metrics", "final metrics\n{text}"),
        Err(err) => warn!(error = %err, "failed to render metrics"),
    }
    Ok(())
}

/// Config path comes from the first CLI argument, then the environment;
/// without either the engine runs on defaults, which still validate.
async fn load_config() -> eyre::Result<EngineConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ARB_ENGINE_CONFIG").ok());
    match path {
        Some(path) => Ok(EngineConfig::load_from_file(&path).await?),
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
