// =============================================================================
// Service wiring (spec §5 & §6) — `Core` composes C1-C5 behind `Arc`s
// =============================================================================
//
// Generalizes the teacher's `app_state.rs` aggregation pattern: one struct
// holding every subsystem behind an `Arc`, constructed once at startup and
// shared across every background task. `Core::start` spawns the background
// tasks spec §5's concurrency model calls for — one execution-scheduler
// loop (the "per-plan slice scheduler"), one price fan-out loop (the
// "per-position price fan-out", reusing the teacher's `exit/monitor.rs`
// periodic-wake idiom), one cache sweep loop, and one single-writer
// activation-cycle loop. The rate-limiter/cache "worker pool" is the
// `tokio` multi-threaded runtime itself — no separate pool is spun up.
// `Core::shutdown` implements the graceful-shutdown contract of spec §6.
// =============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::activation::{
    ActivationDecision, ActivationEngine, ActivationThresholds, HistoricalTrade, MarketConditions, Regime,
    StrategyRecord, StrategyStatus,
};
use crate::backtest::{align_sentiment, SentimentKind};
use crate::cache::{CacheManager, CacheManagerConfig};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::exchange::ExchangeAdapter;
use crate::execution::{
    check_plan_completion, generate_twap_slices, record_slice_failure, record_slice_fill, select_algorithm,
    ExecutionPlan, SliceStatus,
};
use crate::market_data::MarketDataService;
use crate::notify::{Alert, AlertDispatcher, AlertPriority, AlertType};
use crate::persistence::{
    ActivationDecisionEvent, ActivationDecisionLog, BacktestResultArchive, ExecutionPlanArchive, JsonMapStore,
    PositionArchive, RegimeChangeLog,
};
use crate::position::{ExitManager, PositionManager, TrailingStop};
use crate::ratelimit::{RateLimitRule, RateLimiter};
use crate::store::SharedStore;
use crate::types::Side;

/// Price tick broadcast to every subscriber of the per-position fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Minimum closed candles needed before a live market-conditions snapshot
/// (36-bar MA plus a 20-bar volatility window) can be computed.
const CONDITIONS_WARMUP_CANDLES: usize = 37;

pub struct Core {
    pub config: RwLock<RuntimeConfig>,
    pub store: Arc<dyn SharedStore>,
    pub market_data: Arc<dyn MarketDataService>,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub notifier: Arc<dyn AlertDispatcher>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheManager>,
    pub positions: Arc<PositionManager>,

    activation_engine: RwLock<Arc<ActivationEngine>>,
    strategies: RwLock<Vec<StrategyRecord>>,
    history: RwLock<Vec<HistoricalTrade>>,

    plans: DashMap<String, ExecutionPlan>,
    trailing_stops: DashMap<String, Mutex<TrailingStop>>,
    exit_managers: DashMap<String, Mutex<ExitManager>>,

    position_archive: PositionArchive,
    plan_archive: ExecutionPlanArchive,
    #[allow(dead_code)]
    backtest_archive: BacktestResultArchive,
    activation_log: ActivationDecisionLog,
    regime_log: RegimeChangeLog,
    strategy_store: JsonMapStore<StrategyRecord>,

    price_tx: tokio::sync::broadcast::Sender<PriceUpdate>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl Core {
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: RuntimeConfig,
        store: Arc<dyn SharedStore>,
        market_data: Arc<dyn MarketDataService>,
        exchange: Arc<dyn ExchangeAdapter>,
        notifier: Arc<dyn AlertDispatcher>,
    ) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&store)));
        rate_limiter.add_rule(RateLimitRule {
            name: "default".to_string(),
            algorithm: config.rate_limit.algorithm.parse().map_err(|e: CoreError| anyhow::anyhow!(e.details))?,
            requests_per_second: config.rate_limit.requests_per_second,
            burst_size: config.rate_limit.burst_size,
            window_seconds: 1.0,
            path_patterns: vec!["*".to_string()],
            methods: vec![],
            priority: 0,
        });

        let cache = Arc::new(CacheManager::new(
            Arc::clone(&store),
            CacheManagerConfig {
                max_size_per_strategy: config.cache.max_size_per_strategy,
                enable_compression: config.cache.enable_compression,
                compression_threshold_bytes: config.cache.compression_threshold_bytes,
                sweep_interval: StdDuration::from_secs(config.cache.sweep_interval_secs),
            },
        ));

        let thresholds = ActivationThresholds {
            min_historical_trades: config.activation.min_historical_trades,
            min_condition_similarity: config.activation.min_condition_similarity,
            min_alignment: config.activation.min_alignment,
            min_expected_sharpe: config.activation.min_expected_sharpe,
            strong_expected_sharpe: config.activation.strong_expected_sharpe,
            max_active_strategies: config.activation.max_active_strategies,
        };

        let strategy_store: JsonMapStore<StrategyRecord> = JsonMapStore::load(data_dir.join("strategies.json"))?;

        let (price_tx, _rx) = tokio::sync::broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            store,
            market_data,
            exchange,
            notifier,
            rate_limiter,
            cache,
            positions: Arc::new(PositionManager::new()),
            activation_engine: RwLock::new(Arc::new(ActivationEngine::new(thresholds))),
            strategies: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            plans: DashMap::new(),
            trailing_stops: DashMap::new(),
            exit_managers: DashMap::new(),
            position_archive: PositionArchive::open(data_dir)?,
            plan_archive: ExecutionPlanArchive::open(data_dir)?,
            backtest_archive: BacktestResultArchive::open(data_dir)?,
            activation_log: ActivationDecisionLog::open(data_dir)?,
            regime_log: RegimeChangeLog::open(data_dir)?,
            strategy_store,
            price_tx,
            shutdown_tx,
            running: AtomicBool::new(false),
        }))
    }

    pub fn subscribe_prices(&self) -> tokio::sync::broadcast::Receiver<PriceUpdate> {
        self.price_tx.subscribe()
    }

    // -------------------------------------------------------------------
    // C5: strategy registry
    // -------------------------------------------------------------------

    pub fn register_strategy(&self, record: StrategyRecord) -> anyhow::Result<()> {
        self.strategy_store.put(record.id.clone(), record.clone())?;
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.id != record.id);
        strategies.push(record);
        Ok(())
    }

    pub fn record_historical_trade(&self, trade: HistoricalTrade) {
        self.history.write().push(trade);
    }

    // -------------------------------------------------------------------
    // C1: order submission + scheduler tick
    // -------------------------------------------------------------------

    /// Picks an algorithm per `select_algorithm` and seeds a TWAP-style
    /// evenly-spaced slice ledger; adaptive/VWAP/POV plans can be built
    /// directly via `execution::generate_{vwap,pov}_slices` by callers that
    /// need profile-aware scheduling. Registers the plan for the scheduler
    /// loop to drive and persists it immediately.
    pub fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        total_quantity: f64,
        daily_volume: f64,
        urgency: f64,
        duration_minutes: f64,
    ) -> CoreResult<String> {
        let algorithm = select_algorithm(total_quantity, daily_volume, urgency);
        let plan = generate_twap_slices(
            &uuid::Uuid::new_v4().to_string(),
            symbol,
            side,
            total_quantity,
            Utc::now(),
            duration_minutes,
        );
        let order_id = plan.order_id.clone();
        info!(order_id = %order_id, symbol, ?algorithm, total_quantity, "execution plan submitted");
        self.plan_archive.record(&plan).map_err(|e| CoreError::logic(format!("plan persistence failed: {e}")))?;
        self.plans.insert(order_id.clone(), plan);
        Ok(order_id)
    }

    /// Executes every slice whose `scheduled_time` has passed across every
    /// active plan, one exchange submission at a time.
    pub async fn tick_execution(&self) {
        let due_order_ids: Vec<String> = self.plans.iter().map(|e| e.key().clone()).collect();
        for order_id in due_order_ids {
            self.drive_plan(&order_id).await;
        }
    }

    async fn drive_plan(&self, order_id: &str) {
        let (symbol, side, due_slice_id) = {
            let Some(plan) = self.plans.get(order_id) else { return };
            let now = Utc::now();
            let due = plan
                .slices
                .iter()
                .find(|s| s.status == SliceStatus::Pending && s.scheduled_time <= now)
                .map(|s| s.slice_id.clone());
            (plan.symbol.clone(), plan.side, due)
        };
        let Some(slice_id) = due_slice_id else { return };
        let quantity = {
            let plan = self.plans.get(order_id).unwrap();
            plan.slices.iter().find(|s| s.slice_id == slice_id).map(|s| s.quantity).unwrap_or(0.0)
        };

        match self.exchange.submit_slice(&symbol, side, quantity).await {
            Ok(fills) => {
                let avg_price = fills.iter().map(|f| f.price * f.size).sum::<f64>()
                    / fills.iter().map(|f| f.size).sum::<f64>().max(f64::EPSILON);
                let filled_qty: f64 = fills.iter().map(|f| f.size).sum();
                if let Some(mut plan) = self.plans.get_mut(order_id) {
                    if let Err(e) = record_slice_fill(&mut plan, &slice_id, avg_price, filled_qty) {
                        warn!(order_id, %e, "slice fill recording failed");
                    }
                }
            }
            Err(e) => {
                warn!(order_id, slice_id, %e, "slice submission failed");
                if let Some(mut plan) = self.plans.get_mut(order_id) {
                    let _ = record_slice_failure(&mut plan, &slice_id);
                }
            }
        }

        if let Some(plan) = self.plans.get(order_id) {
            let _ = self.plan_archive.record(&plan);
            if check_plan_completion(&plan).is_ok() && plan.completion_rate() >= 0.999 {
                info!(order_id, "execution plan completed");
                drop(plan);
                self.plans.remove(order_id);
            } else if check_plan_completion(&plan).is_err() {
                let reason = check_plan_completion(&plan).unwrap_err();
                self.notifier
                    .send(&Alert::new(AlertPriority::High, AlertType::Risk, format!("plan {order_id} below completion floor: {reason}")))
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------
    // C2: position price fan-out + trailing stop / exit evaluation
    // -------------------------------------------------------------------

    pub fn attach_trailing_stop(&self, position_id: &str, stop: TrailingStop) {
        self.trailing_stops.insert(position_id.to_string(), Mutex::new(stop));
    }

    pub fn attach_exit_manager(&self, position_id: &str, manager: ExitManager) {
        self.exit_managers.insert(position_id.to_string(), Mutex::new(manager));
    }

    /// Pulls the latest close for every tracked symbol, fans it out to
    /// subscribers, and updates every open position on that symbol: marks
    /// MAE/MFE, ratchets its trailing stop, evaluates its exit conditions,
    /// and closes it through the exchange adapter on any trigger.
    pub async fn tick_prices(&self) {
        for symbol in self.market_data.tracked_symbols() {
            let candles = match self.market_data.candles(&symbol, "1m", 1, None).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol, %e, "price tick fetch failed");
                    continue;
                }
            };
            let Some(latest) = candles.last() else { continue };
            let price = latest.close;
            let now = Utc::now();
            let _ = self.price_tx.send(PriceUpdate { symbol: symbol.clone(), price, timestamp: now });

            for position in self.positions.filter(|p| p.symbol == symbol) {
                if let Err(e) = self.positions.update_price(&position.position_id, price, now) {
                    warn!(position_id = %position.position_id, %e, "position price update failed");
                    continue;
                }
                self.evaluate_exits(&position.position_id, &position.symbol, position.side.is_long(), price, now).await;
            }
        }
    }

    async fn evaluate_exits(&self, position_id: &str, symbol: &str, is_long: bool, price: f64, now: DateTime<Utc>) {
        let trailing_triggered = if let Some(entry) = self.trailing_stops.get(position_id) {
            let mut stop = entry.lock();
            stop.update(is_long, price, None);
            stop.should_trigger(is_long, price)
        } else {
            false
        };

        let exit_fired = if let Some(entry) = self.exit_managers.get(position_id) {
            !entry.lock().check(now, price, is_long).is_empty()
        } else {
            false
        };

        if !trailing_triggered && !exit_fired {
            return;
        }

        let side = if is_long { Side::Long } else { Side::Short };
        match self.exchange.submit_slice(symbol, side.opposite(), 0.0).await {
            Ok(_) => {
                if let Ok(position) = self.positions.close(position_id, price, 0.0, now) {
                    let _ = self.position_archive.record(&position, "closed_by_exit_trigger");
                    info!(position_id, "position closed on trailing-stop/exit trigger");
                }
            }
            Err(e) => {
                error!(position_id, %e, "exit-triggered close failed to submit");
                self.notifier
                    .send(&Alert::new(AlertPriority::Critical, AlertType::Risk, format!("failed to close {position_id} on triggered exit: {e}")))
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------
    // C5: single-writer activation cycle
    // -------------------------------------------------------------------

    pub async fn tick_activation(&self) {
        let symbols = self.market_data.tracked_symbols();
        let Some(symbol) = symbols.first().cloned() else {
            return;
        };
        let Some(conditions) = self.current_conditions(&symbol).await else {
            return;
        };

        let strategies = self.strategies.read().clone();
        if strategies.is_empty() {
            return;
        }
        let history = self.history.read().clone();
        let sentiment = align_sentiment(
            &symbol,
            conditions.timestamp,
            &self
                .market_data
                .recent_sentiment(Some(&symbol), Some(SentimentKind::Symbol), 48.0)
                .await
                .unwrap_or_default(),
            0.6,
            0.4,
        );
        let symbol_sentiment = sentiment.combined.map(|c| (c, sentiment.age_hours));

        let engine = Arc::clone(&self.activation_engine.read());
        let mut decisions: Vec<ActivationDecision> = strategies
            .iter()
            .map(|s| engine.evaluate_candidate(s, &conditions, &history, symbol_sentiment, symbol_sentiment, 10))
            .collect();
        engine.apply_concurrency_cap(&mut decisions);

        let mut strategies_guard = self.strategies.write();
        for decision in &decisions {
            if let Some(record) = strategies_guard.iter_mut().find(|s| s.id == decision.strategy_id) {
                record.status = decision.status;
            }
            let _ = self.activation_log.0.append(ActivationDecisionEvent {
                strategy_id: decision.strategy_id.clone(),
                status: decision.status,
                reason: decision.reason.clone(),
                timestamp: Utc::now(),
            });
            if decision.status == StrategyStatus::Deactivated {
                self.notifier
                    .send(&Alert::new(
                        AlertPriority::Medium,
                        AlertType::Performance,
                        format!("strategy {} deactivated: {}", decision.strategy_id, decision.reason),
                    ))
                    .await;
            }
        }
        drop(strategies_guard);

        for record in self.strategies.read().iter() {
            let _ = self.strategy_store.put(record.id.clone(), record.clone());
        }
    }

    /// Builds a `MarketConditions` snapshot from recent candles plus the
    /// symbol/global sentiment blend. Regime classification here reuses
    /// `backtest::label_regime`'s MA-cross + volatility-band rule,
    /// generalized onto the live engine's 7-state `Regime`; `fear_greed_index`,
    /// `btc_correlation`, and `macro_score` have no OHLCV-derivable signal and
    /// default to neutral (0.5) pending a dedicated feed.
    async fn current_conditions(&self, symbol: &str) -> Option<MarketConditions> {
        let candles = self.market_data.candles(symbol, "1h", 64, None).await.ok()?;
        if candles.len() < CONDITIONS_WARMUP_CANDLES {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let n = closes.len();

        let sma = |vals: &[f64], period: usize| -> Option<f64> {
            if vals.len() < period {
                return None;
            }
            Some(vals[vals.len() - period..].iter().sum::<f64>() / period as f64)
        };
        let short = sma(&closes, 12)?;
        let long = sma(&closes, 36)?;

        let lookback = 20.min(n);
        let recent = &closes[n - lookback..];
        let mean: f64 = recent.iter().sum::<f64>() / lookback as f64;
        let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / lookback as f64;
        let volatility = if mean.abs() > f64::EPSILON { variance.sqrt() / mean } else { 0.0 };

        let trend_strength = if long.abs() > f64::EPSILON { ((short - long) / long).clamp(-1.0, 1.0) } else { 0.0 };
        let last_up = closes[n - 1] > closes[n - 2];

        let regime = if volatility >= 0.06 {
            Regime::Crisis
        } else if volatility >= 0.025 {
            Regime::HighVolatility
        } else if volatility <= 0.003 {
            Regime::LowVolatility
        } else if short > long && last_up {
            Regime::BullTrending
        } else if short < long && !last_up {
            Regime::BearTrending
        } else {
            Regime::SidewaysRange
        };

        if let Some(previous) = self.last_logged_regime(symbol) {
            if previous != regime {
                let _ = self.regime_log.0.append(crate::persistence::RegimeChangeEvent {
                    previous: Some(previous),
                    current: regime,
                    timestamp: Utc::now(),
                });
            }
        }

        let vol_recent: f64 = volumes[n.saturating_sub(5)..].iter().sum::<f64>() / 5.0_f64.min(n as f64);
        let vol_baseline: f64 = volumes[n - lookback..].iter().sum::<f64>() / lookback as f64;
        let volume_trend = if vol_baseline > f64::EPSILON { (vol_recent / vol_baseline - 1.0).clamp(-1.0, 1.0) } else { 0.0 };

        Some(MarketConditions {
            timestamp: Utc::now(),
            regime,
            volatility,
            trend_strength,
            volume_trend,
            sentiment_score: 0.0,
            fear_greed_index: 0.5,
            btc_correlation: 0.5,
            liquidity: 0.5,
            macro_score: 0.5,
        })
    }

    fn last_logged_regime(&self, _symbol: &str) -> Option<Regime> {
        self.regime_log.0.entries().last().map(|e| e.current)
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("core starting background loops");

        self.spawn_loop("cache-sweep", StdDuration::from_secs(self.config.read().cache.sweep_interval_secs), {
            let core = Arc::clone(self);
            move || {
                let core = Arc::clone(&core);
                async move { core.cache.clone().run_sweep_loop().await }
            }
        });

        self.spawn_periodic("execution-scheduler", StdDuration::from_secs(1), {
            let core = Arc::clone(self);
            move || {
                let core = Arc::clone(&core);
                async move { core.tick_execution().await }
            }
        });

        self.spawn_periodic("price-fanout", StdDuration::from_secs(5), {
            let core = Arc::clone(self);
            move || {
                let core = Arc::clone(&core);
                async move { core.tick_prices().await }
            }
        });

        let activation_interval = StdDuration::from_secs(self.config.read().activation.cycle_interval_secs);
        self.spawn_periodic("activation-cycle", activation_interval, {
            let core = Arc::clone(self);
            move || {
                let core = Arc::clone(&core);
                async move { core.tick_activation().await }
            }
        });
    }

    /// `run_sweep_loop` drives itself to completion (it owns its own
    /// interval); this just spawns it once and lets the shutdown watch
    /// abort it on drop.
    fn spawn_loop<F, Fut>(&self, name: &'static str, _interval: StdDuration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = f() => {}
                _ = shutdown_rx.changed() => info!(name, "loop stopped by shutdown"),
            }
        });
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: StdDuration, f: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => f().await,
                    _ = shutdown_rx.changed() => {
                        info!(name, "loop stopped by shutdown");
                        break;
                    }
                }
            }
        });
    }

    /// Graceful shutdown (spec §6): flush open-position snapshots, cancel
    /// every pending/executing slice, persist activation state — all within
    /// `drain`. Background loops are signalled to stop immediately; the
    /// flush work itself is synchronous and typically completes well inside
    /// the drain budget.
    pub async fn shutdown(self: &Arc<Self>, drain: StdDuration) -> anyhow::Result<()> {
        info!(drain_secs = drain.as_secs(), "core shutdown initiated");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + drain;

        for position in self.positions.get_open_positions() {
            let _ = self.position_archive.record(&position, "shutdown_snapshot");
        }

        // Snapshot the (order_id, symbol, slice_id) triples needing cancellation
        // without holding a DashMap shard guard across the subsequent await —
        // `tick_execution` takes `get`/`get_mut` on the same map concurrently.
        let mut to_cancel = Vec::new();
        for entry in self.plans.iter() {
            let plan = entry.value();
            for slice in &plan.slices {
                if matches!(slice.status, SliceStatus::Pending | SliceStatus::Executing) {
                    to_cancel.push((plan.order_id.clone(), plan.symbol.clone(), slice.slice_id.clone()));
                }
            }
        }

        for (order_id, symbol, slice_id) in &to_cancel {
            if let Err(e) = self.exchange.cancel(symbol, slice_id).await {
                warn!(order_id, slice_id, %e, "slice cancel failed during shutdown");
            }
            if let Some(mut entry) = self.plans.get_mut(order_id) {
                if let Some(slice) = entry.slices.iter_mut().find(|s| &s.slice_id == slice_id) {
                    slice.status = SliceStatus::Failed;
                }
            }
        }

        for entry in self.plans.iter() {
            let _ = self.plan_archive.record(entry.value());
        }

        for record in self.strategies.read().iter() {
            let _ = self.strategy_store.put(record.id.clone(), record.clone());
        }

        if tokio::time::Instant::now() < deadline {
            tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + StdDuration::from_millis(50))).await;
        }

        info!("core shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::InMemoryExchange;
    use crate::market_data::InMemoryMarketData;
    use crate::notify::LoggingDispatcher;
    use crate::store::InMemoryStore;

    fn make_core(dir: &std::path::Path) -> Arc<Core> {
        Core::new(
            dir,
            RuntimeConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryMarketData::new(200)),
            Arc::new(InMemoryExchange::new("test", 5.0)),
            Arc::new(LoggingDispatcher),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submit_order_registers_an_active_plan() {
        let dir = tempfile::tempdir().unwrap();
        let core = make_core(dir.path());
        let order_id = core.submit_order("BTCUSDT", Side::Long, 100.0, 100_000.0, 0.2, 30.0).unwrap();
        assert!(core.plans.contains_key(&order_id));
    }

    #[tokio::test]
    async fn tick_execution_fills_due_slices_against_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let core = make_core(dir.path());
        if let Some(exchange) = Arc::get_mut(&mut (Arc::clone(&core.exchange) as Arc<dyn ExchangeAdapter>)) {
            let _ = exchange;
        }
        let order_id = core.submit_order("BTCUSDT", Side::Long, 6.0, 100_000.0, 0.1, 30.0).unwrap();
        core.tick_execution().await;
        // The first slice is due immediately; without a configured quote the
        // in-memory exchange errors and the slice is marked failed rather
        // than silently dropped.
        let plan = core.plans.get(&order_id).unwrap();
        assert!(plan.slices.iter().any(|s| s.status != SliceStatus::Pending));
    }

    #[tokio::test]
    async fn tick_activation_skips_cycle_with_no_registered_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let core = make_core(dir.path());
        core.tick_activation().await;
    }

    #[tokio::test]
    async fn shutdown_persists_open_position_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let core = make_core(dir.path());
        let position = core
            .positions
            .open(crate::position::OpenSpec {
                symbol: "BTCUSDT".to_string(),
                strategy_id: "s1".to_string(),
                side: Side::Long,
                size: 1.0,
                price: 100.0,
                fee: 0.0,
                stop_loss_price: None,
                take_profit_price: None,
            })
            .unwrap();
        core.shutdown(StdDuration::from_millis(10)).await.unwrap();
        assert!(core.position_archive.log.entries().iter().any(|e| e.position_id == position.position_id));
    }
}
