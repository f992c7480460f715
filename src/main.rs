// =============================================================================
// Core Trading Engine — Main Entry Point
// =============================================================================
//
// Wires C1-C5 (execution, position, rate-limit/cache, backtest, activation)
// behind `app::Core`, then runs the background loops spec §5 calls for until
// a shutdown signal arrives. The engine starts in Demo + Paused mode for
// safety; a real deployment flips `trading_mode`/`account_mode` via config.
// =============================================================================

mod activation;
mod app;
mod backtest;
mod binance;
mod cache;
mod config;
mod error;
mod exchange;
mod execution;
mod indicators;
mod market_data;
mod notify;
mod persistence;
mod position;
mod ratelimit;
mod store;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::exchange::{BinanceExchange, ExchangeAdapter, InMemoryExchange};
use crate::market_data::{BinanceMarketData, InMemoryMarketData, MarketDataService};
use crate::notify::{AlertDispatcher, LoggingDispatcher};
use crate::store::InMemoryStore;
#[cfg(feature = "redis-store")]
use crate::store::SharedStore;
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
const DATA_DIR: &str = "data";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("core trading engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force Demo + Paused on startup regardless of the saved config;
    // an operator must explicitly switch to Live via a config edit + restart.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(syms) = std::env::var("CORE_SYMBOLS") {
        let parsed: Vec<String> =
            syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
        if !parsed.is_empty() {
            config.symbols = parsed;
        }
    }

    info!(
        symbols = ?config.symbols,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── Shared state store ───────────────────────────────────────────────
    let store = build_store().await?;

    // ── Market data + exchange collaborators ─────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    let market_data: Arc<dyn MarketDataService> = if api_key.is_empty() {
        info!("no BINANCE_API_KEY set — using in-memory market data double");
        Arc::new(InMemoryMarketData::new(500))
    } else {
        let client = Arc::new(binance::BinanceClient::new(api_key.clone(), api_secret.clone()));
        Arc::new(BinanceMarketData::new(client))
    };

    let exchange: Arc<dyn ExchangeAdapter> = if api_key.is_empty() {
        info!("no BINANCE_API_KEY set — using in-memory exchange double");
        Arc::new(InMemoryExchange::new("in_memory", 10.0))
    } else {
        let client = binance::BinanceClient::new(api_key, api_secret);
        Arc::new(BinanceExchange::new(client))
    };

    let notifier: Arc<dyn AlertDispatcher> = Arc::new(LoggingDispatcher);

    // ── Build and start the core ─────────────────────────────────────────
    let drain_secs = config.shutdown_drain_secs;
    let core = app::Core::new(DATA_DIR, config, store, market_data, exchange, notifier)?;
    core.start();

    info!("all subsystems running — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining gracefully");

    core.shutdown(std::time::Duration::from_secs(drain_secs)).await?;

    if let Err(e) = core.config.read().save(CONFIG_PATH) {
        warn!(error = %e, "failed to persist runtime config on shutdown");
    }

    info!("core trading engine shut down complete");
    Ok(())
}

#[cfg(feature = "redis-store")]
async fn build_store() -> anyhow::Result<Arc<dyn SharedStore>> {
    if let Ok(url) = std::env::var("REDIS_URL") {
        info!(url = %url, "connecting to Redis shared store");
        let redis_store = store::redis_store::RedisStore::connect(&url)
            .await
            .map_err(|e| anyhow::anyhow!("redis connect failed: {e}"))?;
        return Ok(Arc::new(redis_store));
    }
    info!("REDIS_URL not set — using in-memory shared store");
    Ok(Arc::new(InMemoryStore::new()))
}

#[cfg(not(feature = "redis-store"))]
async fn build_store() -> anyhow::Result<Arc<dyn crate::store::SharedStore>> {
    info!("using in-memory shared store (redis-store feature disabled)");
    Ok(Arc::new(InMemoryStore::new()))
}
