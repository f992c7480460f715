// =============================================================================
// Backtest Engine (C4) — deterministic, event-time strategy simulation
// =============================================================================
//
// Grounded on this crate's own `indicators/{rsi,ema,bollinger,atr}` (reused
// verbatim) and `regime/detector.rs`'s classification idiom, generalized
// against `examples/original_source/strategy_service/backtest_engine.py` for
// the simulation loop, sentiment gate, and metric bundle.
//
// The regime labeler here is intentionally a *different* rule than the live
// activation engine's classifier (moving-average cross + volatility bands,
// not ADX/Hurst/entropy) — backtests need a cheap, deterministic label per
// candle, not the live engine's richer multi-factor regime.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::ema::calculate_ema;
use crate::indicators::rsi::calculate_rsi;
use crate::market_data::Candle;
use crate::types::{Side, StrategyType};

// ---------------------------------------------------------------------------
// Indicator snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi14: Option<f64>,
    pub sma20: Option<f64>,
    pub ema12: Option<f64>,
    pub ema26: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_width: Option<f64>,
    pub atr14: Option<f64>,
    pub volume_sma20: Option<f64>,
}

fn sma(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Computes the full indicator snapshot series aligned 1:1 with `candles`.
/// `rsi`/`ema` are full-series indicators so they are computed once and
/// sliced by index; `atr`/`bollinger` only expose their latest value so they
/// are recomputed against the growing prefix at each index — acceptable for
/// the bounded candle counts a backtest run works with.
pub fn compute_indicator_series(candles: &[Candle]) -> Vec<IndicatorSnapshot> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let rsi_series = calculate_rsi(&closes, 14);
    let ema12_series = calculate_ema(&closes, 12);
    let ema26_series = calculate_ema(&closes, 26);

    (0..candles.len())
        .map(|i| {
            let rsi14 = rsi_series.get(i.saturating_sub(14)).copied().filter(|_| i >= 14);
            let ema12 = ema12_series.get(i.saturating_sub(11)).copied().filter(|_| i >= 11);
            let ema26 = ema26_series.get(i.saturating_sub(25)).copied().filter(|_| i >= 25);
            let sma20 = sma(&closes[..=i], 20);
            let volume_sma20 = sma(&volumes[..=i], 20);
            let bb = calculate_bollinger(&closes[..=i], 20, 2.0);
            let atr14 = calculate_atr(&candles[..=i], 14);
            IndicatorSnapshot {
                rsi14,
                sma20,
                ema12,
                ema26,
                bb_upper: bb.as_ref().map(|b| b.upper),
                bb_middle: bb.as_ref().map(|b| b.middle),
                bb_lower: bb.as_ref().map(|b| b.lower),
                bb_width: bb.as_ref().map(|b| b.width),
                atr14,
                volume_sma20,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sentiment alignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentKind {
    Symbol,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentEntry {
    pub symbol: Option<String>,
    pub kind: SentimentKind,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub symbol_score: Option<f64>,
    pub global_score: Option<f64>,
    pub combined: Option<f64>,
    pub age_hours: f64,
}

/// Carries forward the latest symbol/global score valid at `as_of`,
/// computing `combined = w_sym*s_sym + w_glob*s_glob` renormalized by the
/// weights actually present.
pub fn align_sentiment(
    symbol: &str,
    as_of: DateTime<Utc>,
    entries: &[SentimentEntry],
    w_sym: f64,
    w_glob: f64,
) -> SentimentSnapshot {
    let latest_symbol = entries
        .iter()
        .filter(|e| e.kind == SentimentKind::Symbol && e.symbol.as_deref() == Some(symbol) && e.timestamp <= as_of)
        .max_by_key(|e| e.timestamp);
    let latest_global = entries
        .iter()
        .filter(|e| e.kind == SentimentKind::Global && e.timestamp <= as_of)
        .max_by_key(|e| e.timestamp);

    let symbol_score = latest_symbol.map(|e| e.score);
    let global_score = latest_global.map(|e| e.score);

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    if let Some(s) = symbol_score {
        weighted_sum += w_sym * s;
        weight_total += w_sym;
    }
    if let Some(g) = global_score {
        weighted_sum += w_glob * g;
        weight_total += w_glob;
    }
    let combined = if weight_total > 0.0 { Some(weighted_sum / weight_total) } else { None };

    let newest = [latest_symbol, latest_global].into_iter().flatten().max_by_key(|e| e.timestamp);
    let age_hours = newest.map(|e| (as_of - e.timestamp).num_minutes() as f64 / 60.0).unwrap_or(f64::MAX);

    SentimentSnapshot { symbol_score, global_score, combined, age_hours }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentBias {
    RiskOn,
    FearBuy,
    Contrarian,
    Balanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SentimentGateParams {
    pub bias: SentimentBias,
    pub min_alignment: f64,
    pub negative_buy_threshold: f64,
    pub extreme_threshold: f64,
    pub allow_missing: bool,
}

/// Gate decision: `(allowed, size_multiplier)`, multiplier in `[0.2, 1.8]`.
/// Stale sentiment (>24h) decays the multiplier toward `0.3..1.0`.
pub fn sentiment_gate(params: &SentimentGateParams, snapshot: &SentimentSnapshot) -> (bool, f64) {
    let Some(combined) = snapshot.combined else {
        return (params.allow_missing, if params.allow_missing { 1.0 } else { 0.0 });
    };

    // RiskOn/FearBuy thresholds are defined over the rescaled `alignment`
    // (glossary: `(combined + 1) / 2`, range [0,1]), not raw `combined`.
    let alignment = (combined + 1.0) / 2.0;

    let (mut allowed, mut multiplier) = match params.bias {
        SentimentBias::RiskOn => (alignment >= params.min_alignment, 1.0),
        SentimentBias::FearBuy => {
            if alignment <= 1.0 - params.negative_buy_threshold {
                (true, 1.0)
            } else if alignment >= params.min_alignment {
                (true, 0.85)
            } else {
                (false, 0.0)
            }
        }
        SentimentBias::Contrarian => (combined.abs() >= params.extreme_threshold, 1.0),
        SentimentBias::Balanced => (true, 1.0),
    };

    if snapshot.age_hours > 24.0 && allowed {
        let decay = (1.0 - (snapshot.age_hours - 24.0) / 96.0).clamp(0.3, 1.0);
        multiplier *= decay;
    }
    if multiplier <= 0.0 {
        allowed = false;
    }
    (allowed, multiplier.clamp(0.2, 1.8))
}

// ---------------------------------------------------------------------------
// Regime labeling (parallel to the live activation engine's classifier)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestRegime {
    BullTrend,
    BearTrend,
    Ranging,
    HighVol,
    LowVol,
}

/// 12/36-bar MA cross with volatility bands: `stdev_ratio >= 0.025 =>
/// high_vol`; `<= 0.005 => low_vol`; otherwise trend direction from the MA
/// cross and the latest close's movement, else ranging.
pub fn label_regime(closes: &[f64], idx: usize) -> BacktestRegime {
    let window = &closes[..=idx];
    let short = sma(window, 12);
    let long = sma(window, 36);
    let stdev_ratio = {
        let lookback = 20.min(window.len());
        let recent = &window[window.len() - lookback..];
        let mean: f64 = recent.iter().sum::<f64>() / lookback as f64;
        if mean.abs() < f64::EPSILON || lookback < 2 {
            0.0
        } else {
            let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / lookback as f64;
            variance.sqrt() / mean
        }
    };

    if stdev_ratio >= 0.025 {
        return BacktestRegime::HighVol;
    }
    if stdev_ratio <= 0.005 {
        return BacktestRegime::LowVol;
    }

    match (short, long) {
        (Some(s), Some(l)) if idx >= 1 => {
            let last_up = closes[idx] > closes[idx - 1];
            if s > l && last_up {
                BacktestRegime::BullTrend
            } else if s < l && !last_up {
                BacktestRegime::BearTrend
            } else {
                BacktestRegime::Ranging
            }
        }
        _ => BacktestRegime::Ranging,
    }
}

// ---------------------------------------------------------------------------
// Strategy predicates (entry/exit per strategy type)
// ---------------------------------------------------------------------------

fn entry_signal(strategy_type: StrategyType, snapshot: &IndicatorSnapshot, candle: &Candle) -> Option<Side> {
    match strategy_type {
        StrategyType::Momentum | StrategyType::TrendFollowing => {
            let (ema12, ema26) = (snapshot.ema12?, snapshot.ema26?);
            if ema12 > ema26 {
                Some(Side::Long)
            } else if ema12 < ema26 {
                Some(Side::Short)
            } else {
                None
            }
        }
        StrategyType::MeanReversion | StrategyType::Swing => {
            let rsi = snapshot.rsi14?;
            if rsi < 30.0 {
                Some(Side::Long)
            } else if rsi > 70.0 {
                Some(Side::Short)
            } else {
                None
            }
        }
        StrategyType::Breakout | StrategyType::Scalping => {
            let upper = snapshot.bb_upper?;
            let lower = snapshot.bb_lower?;
            if candle.close > upper {
                Some(Side::Long)
            } else if candle.close < lower {
                Some(Side::Short)
            } else {
                None
            }
        }
        StrategyType::Arbitrage | StrategyType::Hybrid => {
            let (ema12, ema26, rsi) = (snapshot.ema12?, snapshot.ema26?, snapshot.rsi14?);
            if ema12 > ema26 && rsi < 60.0 {
                Some(Side::Long)
            } else if ema12 < ema26 && rsi > 40.0 {
                Some(Side::Short)
            } else {
                None
            }
        }
    }
}

fn exit_signal(strategy_type: StrategyType, side: Side, snapshot: &IndicatorSnapshot) -> bool {
    match strategy_type {
        StrategyType::Momentum | StrategyType::TrendFollowing => match (snapshot.ema12, snapshot.ema26) {
            (Some(e12), Some(e26)) => side.is_long() == (e12 < e26),
            _ => false,
        },
        StrategyType::MeanReversion | StrategyType::Swing => match snapshot.rsi14 {
            Some(rsi) => (side.is_long() && rsi > 55.0) || (!side.is_long() && rsi < 45.0),
            None => false,
        },
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Config + trade records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub strategy_type: StrategyType,
    pub initial_capital: f64,
    pub max_positions: usize,
    pub position_size_pct: f64,
    pub risk: RiskParams,
    pub sentiment: SentimentGateParams,
    pub preferred_regimes: Vec<BacktestRegime>,
}

#[derive(Debug, Clone)]
struct OpenTrade {
    entry_index: usize,
    entry_price: f64,
    side: Side,
    size: f64,
    regime: BacktestRegime,
    sentiment_combined: Option<f64>,
    stop_loss: f64,
    take_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub entry_index: usize,
    pub exit_index: usize,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub regime: BacktestRegime,
    pub sentiment_combined: Option<f64>,
    pub month: String,
}

// ---------------------------------------------------------------------------
// Metric bundle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreMetrics {
    pub total_return_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub monthly_returns: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentimentMetrics {
    pub allowed_rate: f64,
    pub blocked_rate: f64,
    pub missing_rate: f64,
    pub positive_triggers: u32,
    pub negative_triggers: u32,
    pub average_alignment: f64,
    pub dominant_bias: Option<SentimentBias>,
    pub win_loss_by_label: HashMap<String, (u32, u32)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub trades_per_regime: HashMap<String, u32>,
    pub win_rate_per_regime: HashMap<String, f64>,
    pub preferred_regime_hit_rate: f64,
    pub regime_bias_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestResult {
    pub core: CoreMetrics,
    pub sentiment: SentimentMetrics,
    pub regime: RegimeMetrics,
    pub trades: Vec<ClosedTrade>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BacktestEngine;

impl BacktestEngine {
    /// Runs the full preparation + simulation pipeline against `candles`,
    /// starting evaluation at index 50 so every indicator has warmed up.
    pub fn run(
        symbol: &str,
        candles: &[Candle],
        sentiment_entries: &[SentimentEntry],
        config: &BacktestConfig,
    ) -> CoreResult<BacktestResult> {
        if candles.len() < 51 {
            return Err(CoreError::validation("need at least 51 candles to warm up indicators and simulate"));
        }

        let indicators = compute_indicator_series(candles);
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let mut capital = config.initial_capital;
        let mut equity_curve = vec![capital];
        let mut open_trades: Vec<OpenTrade> = Vec::new();
        let mut closed: Vec<ClosedTrade> = Vec::new();

        let mut gate_allowed = 0u32;
        let mut gate_blocked = 0u32;
        let mut gate_missing = 0u32;
        let mut positive_triggers = 0u32;
        let mut negative_triggers = 0u32;
        let mut alignment_sum = 0.0;
        let mut alignment_count = 0u32;

        for i in 50..candles.len() {
            let candle = &candles[i];
            let snapshot = &indicators[i];
            let regime = label_regime(&closes, i);

            // 2. evaluate exits for every open position.
            let mut still_open = Vec::with_capacity(open_trades.len());
            for trade in open_trades.drain(..) {
                let pnl_fraction = trade.side.sign() * (candle.close - trade.entry_price) / trade.entry_price;
                let hit_stop = pnl_fraction <= -config.risk.stop_loss_pct;
                let hit_target = pnl_fraction >= config.risk.take_profit_pct;
                let strategy_exit = exit_signal(config.strategy_type, trade.side, snapshot);

                if hit_stop || hit_target || strategy_exit {
                    let pnl = trade.size * pnl_fraction;
                    capital += pnl;
                    let month = candle.open_time_month_key();
                    closed.push(ClosedTrade {
                        entry_index: trade.entry_index,
                        exit_index: i,
                        side: trade.side,
                        entry_price: trade.entry_price,
                        exit_price: candle.close,
                        pnl,
                        pnl_pct: pnl_fraction * 100.0,
                        regime: trade.regime,
                        sentiment_combined: trade.sentiment_combined,
                        month,
                    });
                } else {
                    still_open.push(trade);
                }
            }
            open_trades = still_open;

            // 3. evaluate entry when below the concurrency cap.
            if open_trades.len() < config.max_positions {
                if let Some(side) = entry_signal(config.strategy_type, snapshot, candle) {
                    let sentiment_snapshot = align_sentiment(symbol, candle.close_time_as_datetime(), sentiment_entries, 0.6, 0.4);
                    if sentiment_snapshot.combined.is_none() {
                        gate_missing += 1;
                    } else {
                        alignment_sum += sentiment_snapshot.combined.unwrap();
                        alignment_count += 1;
                    }
                    let (allowed, multiplier) = sentiment_gate(&config.sentiment, &sentiment_snapshot);
                    if allowed {
                        gate_allowed += 1;
                        if let Some(c) = sentiment_snapshot.combined {
                            if c > 0.2 {
                                positive_triggers += 1;
                            } else if c < -0.2 {
                                negative_triggers += 1;
                            }
                        }
                        let size = capital * config.position_size_pct * multiplier;
                        let stop_loss = candle.close * (1.0 - side.sign() * config.risk.stop_loss_pct);
                        let take_profit = candle.close * (1.0 + side.sign() * config.risk.take_profit_pct);
                        open_trades.push(OpenTrade {
                            entry_index: i,
                            entry_price: candle.close,
                            side,
                            size,
                            regime,
                            sentiment_combined: sentiment_snapshot.combined,
                            stop_loss,
                            take_profit,
                        });
                    } else {
                        gate_blocked += 1;
                    }
                }
            }

            equity_curve.push(capital);
        }

        let core = compute_core_metrics(config.initial_capital, &equity_curve, &closed);
        let total_gate_events = gate_allowed + gate_blocked;
        let sentiment = SentimentMetrics {
            allowed_rate: ratio(gate_allowed, total_gate_events),
            blocked_rate: ratio(gate_blocked, total_gate_events),
            missing_rate: ratio(gate_missing, total_gate_events + gate_missing),
            positive_triggers,
            negative_triggers,
            average_alignment: if alignment_count > 0 { alignment_sum / alignment_count as f64 } else { 0.0 },
            dominant_bias: Some(config.sentiment.bias),
            win_loss_by_label: win_loss_by_sentiment_label(&closed),
        };
        let regime = compute_regime_metrics(&closed, &config.preferred_regimes);

        Ok(BacktestResult { core, sentiment, regime, trades: closed })
    }

    /// Runs a batch of configs against the same candle/sentiment series on
    /// a CPU worker pool (spec's "CPU workers for backtests" concurrency
    /// model) — used for parameter-sweep grid search over `RiskParams`,
    /// `position_size_pct`, etc. Each config is independent; failures don't
    /// abort the batch, they surface as `Err` at their own index.
    pub fn run_batch(
        symbol: &str,
        candles: &[Candle],
        sentiment_entries: &[SentimentEntry],
        configs: &[BacktestConfig],
    ) -> Vec<CoreResult<BacktestResult>> {
        configs.par_iter().map(|config| Self::run(symbol, candles, sentiment_entries, config)).collect()
    }
}

fn ratio(n: u32, d: u32) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

fn compute_core_metrics(initial_capital: f64, equity_curve: &[f64], trades: &[ClosedTrade]) -> CoreMetrics {
    let final_capital = *equity_curve.last().unwrap_or(&initial_capital);
    let total_return_pct = if initial_capital > 0.0 {
        (final_capital - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    let wins: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losses: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl <= 0.0).collect();
    let win_rate = if trades.is_empty() { 0.0 } else { wins.len() as f64 / trades.len() as f64 };
    let gross_profit: f64 = wins.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.pnl.abs()).sum();
    let profit_factor = if gross_loss > 0.0 { gross_profit / gross_loss } else { gross_profit };

    let mut peak = initial_capital;
    let mut max_drawdown_pct = 0.0;
    let mut drawdowns = Vec::new();
    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        let drawdown = if peak > 0.0 { (peak - equity) / peak * 100.0 } else { 0.0 };
        drawdowns.push(drawdown);
        if drawdown > max_drawdown_pct {
            max_drawdown_pct = drawdown;
        }
    }
    let avg_drawdown_pct = if drawdowns.is_empty() { 0.0 } else { drawdowns.iter().sum::<f64>() / drawdowns.len() as f64 };

    let step_returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| if w[0].abs() > f64::EPSILON { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();
    let sharpe = annualized_sharpe(&step_returns);

    let mut monthly_returns: HashMap<String, f64> = HashMap::new();
    for trade in trades {
        *monthly_returns.entry(trade.month.clone()).or_insert(0.0) += trade.pnl;
    }

    CoreMetrics { total_return_pct, win_rate, profit_factor, avg_drawdown_pct, max_drawdown_pct, sharpe, monthly_returns }
}

/// Sharpe annualized by `sqrt(252)`, treating each simulation step as one
/// trading day — a simplification appropriate for candle-indexed backtests
/// that do not carry wall-clock day boundaries.
fn annualized_sharpe(step_returns: &[f64]) -> f64 {
    if step_returns.len() < 2 {
        return 0.0;
    }
    let mean = step_returns.iter().sum::<f64>() / step_returns.len() as f64;
    let variance = step_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / step_returns.len() as f64;
    let stdev = variance.sqrt();
    if stdev <= f64::EPSILON {
        return 0.0;
    }
    mean / stdev * 252f64.sqrt()
}

fn win_loss_by_sentiment_label(trades: &[ClosedTrade]) -> HashMap<String, (u32, u32)> {
    let mut out: HashMap<String, (u32, u32)> = HashMap::new();
    for trade in trades {
        let label = match trade.sentiment_combined {
            Some(c) if c > 0.2 => "positive",
            Some(c) if c < -0.2 => "negative",
            Some(_) => "neutral",
            None => "missing",
        };
        let entry = out.entry(label.to_string()).or_insert((0, 0));
        if trade.pnl > 0.0 {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }
    out
}

fn compute_regime_metrics(trades: &[ClosedTrade], preferred: &[BacktestRegime]) -> RegimeMetrics {
    let mut trades_per_regime: HashMap<String, u32> = HashMap::new();
    let mut wins_per_regime: HashMap<String, u32> = HashMap::new();

    for trade in trades {
        let key = format!("{:?}", trade.regime);
        *trades_per_regime.entry(key.clone()).or_insert(0) += 1;
        if trade.pnl > 0.0 {
            *wins_per_regime.entry(key).or_insert(0) += 1;
        }
    }

    let win_rate_per_regime: HashMap<String, f64> = trades_per_regime
        .iter()
        .map(|(k, &count)| (k.clone(), ratio(*wins_per_regime.get(k).unwrap_or(&0), count)))
        .collect();

    let preferred_set: Vec<String> = preferred.iter().map(|r| format!("{r:?}")).collect();
    let preferred_trades: u32 = trades.iter().filter(|t| preferred_set.contains(&format!("{:?}", t.regime))).count() as u32;
    let preferred_regime_hit_rate = ratio(preferred_trades, trades.len() as u32);

    let preferred_win_rates: Vec<f64> = win_rate_per_regime
        .iter()
        .filter(|(k, _)| preferred_set.contains(k))
        .map(|(_, v)| *v)
        .collect();
    let other_win_rates: Vec<f64> = win_rate_per_regime
        .iter()
        .filter(|(k, _)| !preferred_set.contains(k))
        .map(|(_, v)| *v)
        .collect();
    let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
    let regime_bias_score = mean(&preferred_win_rates) - mean(&other_win_rates);

    RegimeMetrics { trades_per_regime, win_rate_per_regime, preferred_regime_hit_rate, regime_bias_score }
}

trait CandleTimeExt {
    fn open_time_month_key(&self) -> String;
    fn close_time_as_datetime(&self) -> DateTime<Utc>;
}

impl CandleTimeExt for Candle {
    fn open_time_month_key(&self) -> String {
        let dt = DateTime::<Utc>::from_timestamp_millis(self.open_time).unwrap_or_else(Utc::now);
        dt.format("%Y-%m").to_string()
    }

    fn close_time_as_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.close_time).unwrap_or_else(Utc::now)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, close: f64) -> Candle {
        Candle {
            open_time: i as i64 * 60_000,
            close_time: i as i64 * 60_000 + 59_999,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 1000.0,
            quote_volume: 1000.0 * close,
            trades_count: 10,
            taker_buy_volume: 500.0,
            taker_buy_quote_volume: 500.0 * close,
            is_closed: true,
        }
    }

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0 + i as f64 * 0.1)).collect()
    }

    #[test]
    fn indicator_series_aligned_with_candles() {
        let candles = trending_candles(60);
        let series = compute_indicator_series(&candles);
        assert_eq!(series.len(), candles.len());
        assert!(series.last().unwrap().rsi14.is_some());
        assert!(series.last().unwrap().atr14.is_some());
    }

    #[test]
    fn sentiment_gate_risk_on_requires_minimum_alignment() {
        let params = SentimentGateParams {
            bias: SentimentBias::RiskOn,
            min_alignment: 0.3,
            negative_buy_threshold: 0.6,
            extreme_threshold: 0.7,
            allow_missing: false,
        };
        // combined=0.5 -> alignment=0.75 >= 0.3
        let snapshot = SentimentSnapshot { symbol_score: Some(0.5), global_score: Some(0.5), combined: Some(0.5), age_hours: 1.0 };
        let (allowed, mult) = sentiment_gate(&params, &snapshot);
        assert!(allowed);
        assert!((mult - 1.0).abs() < 1e-9);

        // combined=-0.8 -> alignment=0.1 < 0.3
        let weak = SentimentSnapshot { combined: Some(-0.8), ..snapshot };
        let (allowed, _) = sentiment_gate(&params, &weak);
        assert!(!allowed);
    }

    #[test]
    fn sentiment_gate_risk_on_thresholds_on_alignment_not_combined() {
        // thresholds are defined over alignment = (combined+1)/2, not raw combined.
        let params = SentimentGateParams {
            bias: SentimentBias::RiskOn,
            min_alignment: 0.55,
            negative_buy_threshold: 0.6,
            extreme_threshold: 0.7,
            allow_missing: false,
        };
        // combined=0.2 -> alignment=0.6 >= 0.55: allowed, even though 0.2 < 0.55.
        let snapshot = SentimentSnapshot { combined: Some(0.2), age_hours: 1.0, ..Default::default() };
        let (allowed, _) = sentiment_gate(&params, &snapshot);
        assert!(allowed);
    }

    #[test]
    fn sentiment_gate_fear_buy_deep_negative_scenario() {
        let params = SentimentGateParams {
            bias: SentimentBias::FearBuy,
            min_alignment: 0.55,
            negative_buy_threshold: 0.6,
            extreme_threshold: 0.7,
            allow_missing: false,
        };
        let fresh = SentimentSnapshot { combined: Some(-0.7), age_hours: 2.0, ..Default::default() };
        let (allowed, mult) = sentiment_gate(&params, &fresh);
        assert!(allowed);
        assert!((1.0..=1.15).contains(&mult));

        let stale = SentimentSnapshot { combined: Some(-0.7), age_hours: 48.0, ..Default::default() };
        let (allowed, mult) = sentiment_gate(&params, &stale);
        assert!(allowed);
        assert!((0.5..=0.9).contains(&mult));
    }

    #[test]
    fn sentiment_gate_missing_score_respects_allow_missing() {
        let params = SentimentGateParams {
            bias: SentimentBias::Balanced,
            min_alignment: 0.0,
            negative_buy_threshold: 0.0,
            extreme_threshold: 0.0,
            allow_missing: true,
        };
        let snapshot = SentimentSnapshot::default();
        let (allowed, mult) = sentiment_gate(&params, &snapshot);
        assert!(allowed);
        assert_eq!(mult, 1.0);
    }

    #[test]
    fn stale_sentiment_decays_multiplier() {
        let params = SentimentGateParams {
            bias: SentimentBias::Balanced,
            min_alignment: 0.0,
            negative_buy_threshold: 0.0,
            extreme_threshold: 0.0,
            allow_missing: false,
        };
        let fresh = SentimentSnapshot { combined: Some(0.5), age_hours: 1.0, ..Default::default() };
        let stale = SentimentSnapshot { combined: Some(0.5), age_hours: 72.0, ..Default::default() };
        let (_, fresh_mult) = sentiment_gate(&params, &fresh);
        let (_, stale_mult) = sentiment_gate(&params, &stale);
        assert!(stale_mult < fresh_mult);
    }

    #[test]
    fn regime_label_detects_high_volatility() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + if i % 2 == 0 { 20.0 } else { -20.0 }).collect();
        assert_eq!(label_regime(&closes, 39), BacktestRegime::HighVol);
    }

    #[test]
    fn regime_label_detects_bull_trend_on_steady_rise() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.05).collect();
        assert_eq!(label_regime(&closes, 39), BacktestRegime::BullTrend);
    }

    #[test]
    fn run_rejects_too_few_candles() {
        let candles = trending_candles(10);
        let config = BacktestConfig {
            strategy_type: StrategyType::TrendFollowing,
            initial_capital: 10_000.0,
            max_positions: 1,
            position_size_pct: 0.1,
            risk: RiskParams { stop_loss_pct: 0.02, take_profit_pct: 0.04 },
            sentiment: SentimentGateParams {
                bias: SentimentBias::Balanced,
                min_alignment: 0.0,
                negative_buy_threshold: 0.0,
                extreme_threshold: 0.0,
                allow_missing: true,
            },
            preferred_regimes: vec![BacktestRegime::BullTrend],
        };
        let result = BacktestEngine::run("BTCUSDT", &candles, &[], &config);
        assert!(result.is_err());
    }

    #[test]
    fn run_produces_metric_bundle_on_trending_series() {
        let candles = trending_candles(120);
        let config = BacktestConfig {
            strategy_type: StrategyType::TrendFollowing,
            initial_capital: 10_000.0,
            max_positions: 2,
            position_size_pct: 0.1,
            risk: RiskParams { stop_loss_pct: 0.05, take_profit_pct: 0.1 },
            sentiment: SentimentGateParams {
                bias: SentimentBias::Balanced,
                min_alignment: 0.0,
                negative_buy_threshold: 0.0,
                extreme_threshold: 0.0,
                allow_missing: true,
            },
            preferred_regimes: vec![BacktestRegime::BullTrend],
        };
        let result = BacktestEngine::run("BTCUSDT", &candles, &[], &config).unwrap();
        assert!(result.core.monthly_returns.len() <= 120);
        assert!(result.sentiment.missing_rate >= 0.0);
    }

    #[test]
    fn run_batch_evaluates_every_config_independently() {
        let candles = trending_candles(120);
        let base_sentiment = SentimentGateParams {
            bias: SentimentBias::Balanced,
            min_alignment: 0.0,
            negative_buy_threshold: 0.0,
            extreme_threshold: 0.0,
            allow_missing: true,
        };
        let configs: Vec<BacktestConfig> = [0.02, 0.05, 0.1]
            .iter()
            .map(|&sl| BacktestConfig {
                strategy_type: StrategyType::TrendFollowing,
                initial_capital: 10_000.0,
                max_positions: 2,
                position_size_pct: 0.1,
                risk: RiskParams { stop_loss_pct: sl, take_profit_pct: sl * 2.0 },
                sentiment: base_sentiment.clone(),
                preferred_regimes: vec![BacktestRegime::BullTrend],
            })
            .collect();

        let results = BacktestEngine::run_batch("BTCUSDT", &candles, &[], &configs);
        assert_eq!(results.len(), configs.len());
        for r in results {
            assert!(r.is_ok());
        }
    }

    #[test]
    fn run_batch_surfaces_per_config_errors_without_aborting() {
        let too_short = trending_candles(5);
        let ok_config = BacktestConfig {
            strategy_type: StrategyType::TrendFollowing,
            initial_capital: 10_000.0,
            max_positions: 1,
            position_size_pct: 0.1,
            risk: RiskParams { stop_loss_pct: 0.02, take_profit_pct: 0.04 },
            sentiment: SentimentGateParams {
                bias: SentimentBias::Balanced,
                min_alignment: 0.0,
                negative_buy_threshold: 0.0,
                extreme_threshold: 0.0,
                allow_missing: true,
            },
            preferred_regimes: vec![BacktestRegime::BullTrend],
        };
        let results = BacktestEngine::run_batch("BTCUSDT", &too_short, &[], &[ok_config]);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
