// =============================================================================
// Position Manager (C2) — position lifecycle, trailing stops, ladders, exits,
// hedges — Position/Fill data model.
// =============================================================================
//
// Grounded on a `RwLock`-per-position idiom, a `Fill` ledger, and an
// "archive once closed" lifecycle, generalized to a fuller field set, plus
// `examples/original_source/position_management/{position_manager,
// trailing_stops,scale_manager,exit_manager,hedge_manager}.py` for the exact
// per-feature formulas. Cyclic references (position <-> stop/ladder/exit
// managers in the source) are cut per design note: every auxiliary structure
// below holds only a `position_id` and is driven by the `PositionManager`,
// never the reverse.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Fill / Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub is_closing: bool,
    pub fee: f64,
}

impl Fill {
    pub fn opening(price: f64, size: f64, fee: f64) -> Self {
        Self {
            fill_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            price,
            size,
            is_closing: false,
            fee,
        }
    }

    pub fn closing(price: f64, size: f64, fee: f64) -> Self {
        Self {
            fill_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            price,
            size,
            is_closing: true,
            fee,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
    Liquidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub side: Side,
    pub status: PositionStatus,

    pub initial_size: f64,
    pub current_size: f64,
    pub average_entry_price: f64,
    pub current_price: f64,
    pub last_update_time: DateTime<Utc>,

    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fees: f64,
    pub total_funding: f64,

    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,

    /// Signed extremes of running PnL fraction since open. MAE <= 0, MFE >= 0.
    pub max_adverse_excursion: f64,
    pub max_favorable_excursion: f64,

    pub fills: Vec<Fill>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// `realized_pnl` as a percentage of the notional at open. Reported
    /// against the initial notional at open, not the current size.
    pub fn realized_pnl_pct(&self) -> f64 {
        let notional = self.initial_size * self.average_entry_price;
        if notional.abs() < f64::EPSILON {
            0.0
        } else {
            self.realized_pnl / notional * 100.0
        }
    }

    fn pnl_fraction(&self, price: f64) -> f64 {
        if self.average_entry_price.abs() < f64::EPSILON {
            return 0.0;
        }
        self.side.sign() * (price - self.average_entry_price) / self.average_entry_price
    }

    fn opening_fills_size(&self) -> f64 {
        self.fills.iter().filter(|f| !f.is_closing).map(|f| f.size).sum()
    }

    fn closing_fills_size(&self) -> f64 {
        self.fills.iter().filter(|f| f.is_closing).map(|f| f.size).sum()
    }

    /// Invariant check used by tests and by every mutator before committing a
    /// change: `current_size = Σ opening_fills.size − Σ closing_fills.size`.
    fn check_invariant(&self) -> CoreResult<()> {
        let expected = self.opening_fills_size() - self.closing_fills_size();
        if (self.current_size - expected).abs() > 1e-6 {
            return Err(CoreError::logic(format!(
                "position {} invariant violated: current_size={} expected={}",
                self.position_id, self.current_size, expected
            )));
        }
        if self.current_size < -1e-9 {
            return Err(CoreError::logic(format!(
                "position {} current_size went negative: {}",
                self.position_id, self.current_size
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Open spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub symbol: String,
    pub strategy_id: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// PositionManager
// ---------------------------------------------------------------------------

/// Indexed container of every position, single-writer per `position_id`.
/// A `DashMap<String, RwLock<Position>>` gives lock-per-shard
/// semantics so mutating one position never blocks readers of another,
/// without a global lock anywhere in the manager.
pub struct PositionManager {
    positions: DashMap<String, RwLock<Position>>,
    archive: RwLock<Vec<Position>>,
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            archive: RwLock::new(Vec::new()),
        }
    }

    pub fn open(&self, spec: OpenSpec) -> CoreResult<Position> {
        if spec.size <= 0.0 {
            return Err(CoreError::validation("open size must be positive"));
        }
        let now = Utc::now();
        let fill = Fill::opening(spec.price, spec.size, spec.fee);
        let position = Position {
            position_id: Uuid::new_v4().to_string(),
            symbol: spec.symbol,
            strategy_id: spec.strategy_id,
            side: spec.side,
            status: PositionStatus::Open,
            initial_size: spec.size,
            current_size: spec.size,
            average_entry_price: spec.price,
            current_price: spec.price,
            last_update_time: now,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_fees: spec.fee,
            total_funding: 0.0,
            stop_loss_price: spec.stop_loss_price,
            take_profit_price: spec.take_profit_price,
            trailing_stop_price: None,
            max_adverse_excursion: 0.0,
            max_favorable_excursion: 0.0,
            fills: vec![fill],
            opened_at: now,
        };
        position.check_invariant()?;
        info!(position_id = %position.position_id, symbol = %position.symbol, side = %position.side, size = spec.size, price = spec.price, "position opened");
        self.positions.insert(position.position_id.clone(), RwLock::new(position.clone()));
        Ok(position)
    }

    fn with_position_mut<F, R>(&self, id: &str, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut Position) -> CoreResult<R>,
    {
        let Some(entry) = self.positions.get(id) else {
            return Err(CoreError::validation(format!("unknown position {id}")));
        };
        let mut guard = entry.write();
        f(&mut guard)
    }

    /// Recomputes unrealized PnL and updates MAE/MFE.
    pub fn update_price(&self, id: &str, price: f64, t: DateTime<Utc>) -> CoreResult<Position> {
        self.with_position_mut(id, |pos| {
            pos.current_price = price;
            pos.last_update_time = t;
            pos.unrealized_pnl = pos.side.sign() * (price - pos.average_entry_price) * pos.current_size;
            let frac = pos.pnl_fraction(price);
            pos.max_adverse_excursion = pos.max_adverse_excursion.min(frac.min(0.0));
            pos.max_favorable_excursion = pos.max_favorable_excursion.max(frac.max(0.0));
            pos.check_invariant()?;
            Ok(pos.clone())
        })
    }

    /// Scales in — recomputes `average_entry_price` as the volume-weighted
    /// average over opening fills only.
    pub fn add(&self, id: &str, fill: Fill) -> CoreResult<Position> {
        if fill.is_closing {
            return Err(CoreError::validation("add() requires an opening fill"));
        }
        if fill.size <= 0.0 {
            return Err(CoreError::validation("fill size must be positive"));
        }
        self.with_position_mut(id, |pos| {
            if pos.status == PositionStatus::Closed {
                return Err(CoreError::validation("cannot mutate a closed position"));
            }
            let prior_notional = pos.average_entry_price * pos.opening_fills_size();
            let new_notional = fill.price * fill.size;
            pos.fills.push(fill.clone());
            let new_opening_size = pos.opening_fills_size();
            pos.average_entry_price = (prior_notional + new_notional) / new_opening_size;
            pos.current_size += fill.size;
            pos.total_fees += fill.fee;
            pos.last_update_time = fill.timestamp;
            pos.check_invariant()?;
            info!(position_id = %pos.position_id, size = fill.size, price = fill.price, "position scaled in");
            Ok(pos.clone())
        })
    }

    /// Partial close. `realized_pnl` of this reduction =
    /// `side * (price - avg_entry) * size - fee`.
    pub fn reduce(&self, id: &str, fill: Fill) -> CoreResult<Position> {
        if !fill.is_closing {
            return Err(CoreError::validation("reduce() requires a closing fill"));
        }
        if fill.size <= 0.0 {
            return Err(CoreError::validation("fill size must be positive"));
        }
        let closed_now = self.with_position_mut(id, |pos| {
            if pos.status == PositionStatus::Closed {
                return Err(CoreError::validation("cannot mutate a closed position"));
            }
            if fill.size > pos.current_size + 1e-9 {
                return Err(CoreError::validation(format!(
                    "reduce size {} exceeds current_size {}",
                    fill.size, pos.current_size
                )));
            }
            let realized = pos.side.sign() * (fill.price - pos.average_entry_price) * fill.size - fill.fee;
            pos.realized_pnl += realized;
            pos.current_size -= fill.size;
            pos.total_fees += fill.fee;
            pos.fills.push(fill.clone());
            pos.last_update_time = fill.timestamp;
            pos.current_price = fill.price;
            if pos.current_size <= 1e-9 {
                pos.current_size = 0.0;
                pos.status = PositionStatus::Closed;
            } else {
                pos.status = PositionStatus::PartiallyClosed;
            }
            pos.check_invariant()?;
            info!(position_id = %pos.position_id, realized = realized, remaining = pos.current_size, "position reduced");
            Ok(pos.status == PositionStatus::Closed)
        })?;

        if closed_now {
            if let Some((_, lock)) = self.positions.remove(id) {
                self.archive.write().push(lock.into_inner());
            }
            return self.archive.read().iter().rev().find(|p| p.position_id == id).cloned().ok_or_else(|| {
                CoreError::logic("position vanished from archive after close")
            });
        }
        self.with_position_mut(id, |pos| Ok(pos.clone()))
    }

    /// Convenience: reduce by the full `current_size`.
    pub fn close(&self, id: &str, price: f64, fee: f64, t: DateTime<Utc>) -> CoreResult<Position> {
        let size = {
            let Some(entry) = self.positions.get(id) else {
                return Err(CoreError::validation(format!("unknown position {id}")));
            };
            entry.read().current_size
        };
        let mut fill = Fill::closing(price, size, fee);
        fill.timestamp = t;
        self.reduce(id, fill)
    }

    /// Forced full closure by an exchange liquidation event: closes the
    /// entire `current_size` at `price` (realized PnL computed the usual
    /// way) but terminates into `PositionStatus::Liquidated` rather than
    /// `Closed`, so callers/archives can distinguish a forced exit from a
    /// voluntary one.
    pub fn liquidate(&self, id: &str, price: f64, fee: f64, t: DateTime<Utc>) -> CoreResult<Position> {
        let closed_now = self.with_position_mut(id, |pos| {
            if pos.status == PositionStatus::Closed || pos.status == PositionStatus::Liquidated {
                return Err(CoreError::validation("cannot liquidate an already-closed position"));
            }
            let size = pos.current_size;
            let fill = Fill::closing(price, size, fee);
            let realized = pos.side.sign() * (fill.price - pos.average_entry_price) * fill.size - fill.fee;
            pos.realized_pnl += realized;
            pos.current_size = 0.0;
            pos.total_fees += fill.fee;
            pos.fills.push(fill);
            pos.last_update_time = t;
            pos.current_price = price;
            pos.status = PositionStatus::Liquidated;
            pos.check_invariant()?;
            warn!(position_id = %pos.position_id, realized = realized, "position liquidated");
            Ok(true)
        })?;

        if closed_now {
            if let Some((_, lock)) = self.positions.remove(id) {
                self.archive.write().push(lock.into_inner());
            }
            return self.archive.read().iter().rev().find(|p| p.position_id == id).cloned().ok_or_else(|| {
                CoreError::logic("position vanished from archive after liquidation")
            });
        }
        self.with_position_mut(id, |pos| Ok(pos.clone()))
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.positions.get(id).map(|e| e.read().clone()).or_else(|| {
            self.archive.read().iter().find(|p| p.position_id == id).cloned()
        })
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().read().clone()).collect()
    }

    pub fn filter<F: Fn(&Position) -> bool>(&self, pred: F) -> Vec<Position> {
        self.get_open_positions().into_iter().filter(|p| pred(p)).collect()
    }

    pub fn totals(&self) -> PositionTotals {
        let open = self.get_open_positions();
        let archived = self.archive.read();
        PositionTotals {
            open_count: open.len(),
            closed_count: archived.len(),
            total_unrealized_pnl: open.iter().map(|p| p.unrealized_pnl).sum(),
            total_realized_pnl: open.iter().map(|p| p.realized_pnl).sum::<f64>()
                + archived.iter().map(|p| p.realized_pnl).sum::<f64>(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionTotals {
    pub open_count: usize,
    pub closed_count: usize,
    pub total_unrealized_pnl: f64,
    pub total_realized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Trailing stops — grounded on
// original_source/position_management/trailing_stops.py
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum TrailingStop {
    Percentage {
        trail_pct: f64,
        high_watermark: f64,
        stop_price: f64,
    },
    Atr {
        atr_multiplier: f64,
        current_atr: f64,
        high_watermark: f64,
        stop_price: f64,
    },
    Chandelier {
        atr_multiplier: f64,
        lookback: usize,
        prices: Vec<f64>,
        current_atr: f64,
        stop_price: f64,
    },
    ParabolicSar {
        af: f64,
        af_increment: f64,
        max_af: f64,
        extreme_point: f64,
        sar: f64,
    },
}

impl TrailingStop {
    pub fn percentage(entry_price: f64, is_long: bool, trail_pct: f64) -> Self {
        let stop_price = if is_long {
            entry_price * (1.0 - trail_pct)
        } else {
            entry_price * (1.0 + trail_pct)
        };
        Self::Percentage { trail_pct, high_watermark: entry_price, stop_price }
    }

    pub fn atr(entry_price: f64, is_long: bool, atr_multiplier: f64, initial_atr: f64) -> Self {
        let stop_price = if is_long {
            entry_price - initial_atr * atr_multiplier
        } else {
            entry_price + initial_atr * atr_multiplier
        };
        Self::Atr { atr_multiplier, current_atr: initial_atr, high_watermark: entry_price, stop_price }
    }

    pub fn chandelier(entry_price: f64, is_long: bool, atr_multiplier: f64, initial_atr: f64, lookback: usize) -> Self {
        let stop_price = if is_long {
            entry_price - initial_atr * atr_multiplier
        } else {
            entry_price + initial_atr * atr_multiplier
        };
        Self::Chandelier {
            atr_multiplier,
            lookback: lookback.max(1),
            prices: vec![entry_price],
            current_atr: initial_atr,
            stop_price,
        }
    }

    pub fn parabolic_sar(entry_price: f64, is_long: bool) -> Self {
        let sar = if is_long { entry_price * 0.98 } else { entry_price * 1.02 };
        Self::ParabolicSar { af: 0.02, af_increment: 0.02, max_af: 0.20, extreme_point: entry_price, sar }
    }

    /// Ratchets the stop and returns the new stop price. Long stops only
    /// ever increase; short stops only ever decrease.
    pub fn update(&mut self, is_long: bool, current_price: f64, current_atr: Option<f64>) -> f64 {
        match self {
            Self::Percentage { trail_pct, high_watermark, stop_price } => {
                if is_long {
                    if current_price > *high_watermark {
                        *high_watermark = current_price;
                        let new_stop = *high_watermark * (1.0 - *trail_pct);
                        if new_stop > *stop_price {
                            *stop_price = new_stop;
                        }
                    }
                } else if current_price < *high_watermark {
                    *high_watermark = current_price;
                    let new_stop = *high_watermark * (1.0 + *trail_pct);
                    if new_stop < *stop_price {
                        *stop_price = new_stop;
                    }
                }
                *stop_price
            }
            Self::Atr { atr_multiplier, current_atr: atr, high_watermark, stop_price } => {
                if let Some(a) = current_atr {
                    *atr = a;
                }
                if is_long {
                    if current_price > *high_watermark {
                        *high_watermark = current_price;
                        let new_stop = *high_watermark - *atr * *atr_multiplier;
                        if new_stop > *stop_price {
                            *stop_price = new_stop;
                        }
                    }
                } else if current_price < *high_watermark {
                    *high_watermark = current_price;
                    let new_stop = *high_watermark + *atr * *atr_multiplier;
                    if new_stop < *stop_price {
                        *stop_price = new_stop;
                    }
                }
                *stop_price
            }
            Self::Chandelier { atr_multiplier, lookback, prices, current_atr: atr, stop_price } => {
                prices.push(current_price);
                if prices.len() > *lookback {
                    prices.remove(0);
                }
                if let Some(a) = current_atr {
                    *atr = a;
                }
                if is_long {
                    let hh = prices.iter().cloned().fold(f64::MIN, f64::max);
                    let new_stop = hh - *atr * *atr_multiplier;
                    if new_stop > *stop_price {
                        *stop_price = new_stop;
                    }
                } else {
                    let ll = prices.iter().cloned().fold(f64::MAX, f64::min);
                    let new_stop = ll + *atr * *atr_multiplier;
                    if new_stop < *stop_price {
                        *stop_price = new_stop;
                    }
                }
                *stop_price
            }
            Self::ParabolicSar { af, af_increment, max_af, extreme_point, sar } => {
                if is_long {
                    if current_price > *extreme_point {
                        *extreme_point = current_price;
                        *af = (*af + *af_increment).min(*max_af);
                    }
                    let new_sar = *sar + *af * (*extreme_point - *sar);
                    if new_sar > *sar {
                        *sar = new_sar;
                    }
                } else {
                    if current_price < *extreme_point {
                        *extreme_point = current_price;
                        *af = (*af + *af_increment).min(*max_af);
                    }
                    let new_sar = *sar - *af * (*sar - *extreme_point);
                    if new_sar < *sar {
                        *sar = new_sar;
                    }
                }
                *sar
            }
        }
    }

    pub fn stop_price(&self) -> f64 {
        match self {
            Self::Percentage { stop_price, .. } => *stop_price,
            Self::Atr { stop_price, .. } => *stop_price,
            Self::Chandelier { stop_price, .. } => *stop_price,
            Self::ParabolicSar { sar, .. } => *sar,
        }
    }

    pub fn should_trigger(&self, is_long: bool, current_price: f64) -> bool {
        let stop = self.stop_price();
        if is_long {
            current_price <= stop
        } else {
            current_price >= stop
        }
    }
}

// ---------------------------------------------------------------------------
// Scale-in / scale-out ladders — grounded on
// original_source/position_management/scale_manager.py
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeDistribution {
    Equal,
    Random,
    Increasing,
    Decreasing,
    Pyramid,
    InversePyramid,
}

impl SizeDistribution {
    fn raw_weights(self, n: usize, is_long: bool) -> Vec<f64> {
        let seq_up: Vec<f64> = (1..=n).map(|i| i as f64).collect();
        let seq_down: Vec<f64> = (1..=n).map(|i| (n + 1 - i) as f64).collect();
        match self {
            Self::Equal => vec![1.0; n],
            Self::Random => {
                let mut rng = rand::thread_rng();
                (0..n).map(|_| rng.gen_range(0.5..1.5)).collect()
            }
            Self::Increasing => seq_up,
            Self::Decreasing => seq_down,
            Self::Pyramid => {
                if is_long {
                    seq_down
                } else {
                    seq_up
                }
            }
            Self::InversePyramid => {
                if is_long {
                    seq_up
                } else {
                    seq_down
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderLevel {
    pub level_id: String,
    pub price_trigger: f64,
    pub size: f64,
    pub filled: bool,
}

#[derive(Debug, Clone)]
pub struct Ladder {
    pub position_id: String,
    pub is_long: bool,
    /// `true` for scale-in (add to position), `false` for scale-out (reduce).
    pub is_scale_in: bool,
    pub levels: Vec<LadderLevel>,
}

impl Ladder {
    /// Builds levels from either explicit `price_levels` or by compounding
    /// `price_spacing_pct` from `entry_price`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position_id: &str,
        is_long: bool,
        is_scale_in: bool,
        entry_price: f64,
        total_size: f64,
        num_levels: usize,
        distribution: SizeDistribution,
        price_spacing_pct: f64,
        explicit_price_levels: Option<Vec<f64>>,
    ) -> Self {
        let n = num_levels.max(1);
        let prices = explicit_price_levels.unwrap_or_else(|| {
            let mut levels = Vec::with_capacity(n);
            let mut price = entry_price;
            for _ in 0..n {
                levels.push(price);
                // scale-in favorable direction mirrors scale-out's opposite.
                let favorable_down = is_scale_in == is_long;
                price *= if favorable_down { 1.0 - price_spacing_pct } else { 1.0 + price_spacing_pct };
            }
            levels
        });
        let weights = distribution.raw_weights(prices.len(), is_long);
        let weight_sum: f64 = weights.iter().sum();
        let sizes: Vec<f64> = weights.iter().map(|w| w / weight_sum * total_size).collect();
        let levels = prices
            .into_iter()
            .zip(sizes)
            .enumerate()
            .map(|(i, (price_trigger, size))| LadderLevel {
                level_id: format!("{position_id}_level_{i}"),
                price_trigger,
                size,
                filled: false,
            })
            .collect();
        Self { position_id: position_id.to_string(), is_long, is_scale_in, levels }
    }

    /// Levels whose trigger has been crossed in the favorable direction,
    /// returned in order. Scale-in triggers on adverse price
    /// moves (buy the dip); scale-out triggers on favorable moves (take
    /// profit), so the comparison direction flips on `is_scale_in`.
    pub fn check_triggers(&self, current_price: f64) -> Vec<LadderLevel> {
        let triggers_below = self.is_long == self.is_scale_in;
        self.levels
            .iter()
            .filter(|l| !l.filled)
            .filter(|l| {
                if triggers_below {
                    current_price <= l.price_trigger
                } else {
                    current_price >= l.price_trigger
                }
            })
            .cloned()
            .collect()
    }

    pub fn mark_filled(&mut self, level_id: &str) {
        if let Some(level) = self.levels.iter_mut().find(|l| l.level_id == level_id) {
            level.filled = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.levels.iter().all(|l| l.filled)
    }
}

// ---------------------------------------------------------------------------
// Exit manager — grounded on
// original_source/position_management/exit_manager.py
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    TimeBased,
    ProfitTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitCondition {
    pub condition_id: String,
    pub kind: ExitKind,
    /// Lower value = higher priority.
    pub priority: i32,
    /// Fraction of the position (0.0-1.0) this condition exits.
    pub size_fraction: f64,
    pub target_price: Option<f64>,
    pub max_holding: Option<chrono::Duration>,
    pub triggered: bool,
}

pub struct ExitManager {
    position_id: String,
    entry_time: DateTime<Utc>,
    conditions: Vec<ExitCondition>,
}

impl ExitManager {
    pub fn new(position_id: &str, entry_time: DateTime<Utc>) -> Self {
        Self { position_id: position_id.to_string(), entry_time, conditions: Vec::new() }
    }

    pub fn add_max_holding(&mut self, max_hours: f64, size_fraction: f64, priority: i32) {
        self.conditions.push(ExitCondition {
            condition_id: format!("{}_max_hold_{}", self.position_id, self.conditions.len()),
            kind: ExitKind::TimeBased,
            priority,
            size_fraction,
            target_price: None,
            max_holding: Some(chrono::Duration::seconds((max_hours * 3600.0) as i64)),
            triggered: false,
        });
    }

    pub fn add_profit_target(&mut self, target_price: f64, size_fraction: f64, priority: i32) {
        self.conditions.push(ExitCondition {
            condition_id: format!("{}_target_{}", self.position_id, self.conditions.len()),
            kind: ExitKind::ProfitTarget,
            priority,
            size_fraction,
            target_price: Some(target_price),
            max_holding: None,
            triggered: false,
        });
    }

    /// Returns all newly-triggered conditions, sorted by priority ascending
    /// on each update. The caller decides how many to action.
    pub fn check(&mut self, current_time: DateTime<Utc>, current_price: f64, is_long: bool) -> Vec<ExitCondition> {
        let mut fired = Vec::new();
        for c in self.conditions.iter_mut().filter(|c| !c.triggered) {
            let hit = match c.kind {
                ExitKind::TimeBased => {
                    c.max_holding.map(|max| current_time - self.entry_time >= max).unwrap_or(false)
                }
                ExitKind::ProfitTarget => c.target_price.map(|tp| {
                    if is_long {
                        current_price >= tp
                    } else {
                        current_price <= tp
                    }
                }).unwrap_or(false),
            };
            if hit {
                c.triggered = true;
                fired.push(c.clone());
            }
        }
        fired.sort_by_key(|c| c.priority);
        fired
    }
}

// ---------------------------------------------------------------------------
// Hedge manager — grounded on
// original_source/position_management/hedge_manager.py
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeKind {
    Full,
    Partial,
    DeltaScaled,
    CrossAsset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hedge {
    pub hedge_id: String,
    pub position_id: String,
    pub hedge_position_id: String,
    pub kind: HedgeKind,
    pub ratio: f64,
    pub size: f64,
    /// Price-correlation weight used for cross-asset hedges (1.0 for
    /// same-asset hedges).
    pub correlation: f64,
}

#[derive(Default)]
pub struct HedgeManager {
    hedges: RwLock<Vec<Hedge>>,
}

impl HedgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a hedge sibling position through `manager` and records it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_hedge(
        &self,
        manager: &PositionManager,
        position: &Position,
        kind: HedgeKind,
        ratio: f64,
        hedge_symbol: &str,
        hedge_price: f64,
        correlation: f64,
    ) -> CoreResult<Hedge> {
        let size = position.current_size * ratio;
        let spec = OpenSpec {
            symbol: hedge_symbol.to_string(),
            strategy_id: format!("{}_hedge", position.strategy_id),
            side: position.side.opposite(),
            size,
            price: hedge_price,
            fee: 0.0,
            stop_loss_price: None,
            take_profit_price: None,
        };
        let hedge_position = manager.open(spec)?;
        let hedge = Hedge {
            hedge_id: Uuid::new_v4().to_string(),
            position_id: position.position_id.clone(),
            hedge_position_id: hedge_position.position_id.clone(),
            kind,
            ratio,
            size,
            correlation,
        };
        self.hedges.write().push(hedge.clone());
        Ok(hedge)
    }

    pub fn hedges_for(&self, position_id: &str) -> Vec<Hedge> {
        self.hedges.read().iter().filter(|h| h.position_id == position_id).cloned().collect()
    }

    /// `net_exposure(id) = position_size − Σ hedge_size·ratio`.
    pub fn net_exposure(&self, position_size: f64, position_id: &str) -> f64 {
        let hedged: f64 = self.hedges_for(position_id).iter().map(|h| h.size * h.ratio).sum();
        position_size - hedged
    }
}

#[allow(unused)]
fn shared(manager: Arc<PositionManager>) -> Arc<PositionManager> {
    manager
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn open_spec(side: Side, size: f64, price: f64) -> OpenSpec {
        OpenSpec {
            symbol: "BTCUSDT".into(),
            strategy_id: "s1".into(),
            side,
            size,
            price,
            fee: 0.0,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    #[test]
    fn open_reduce_full_equals_close() {
        let m = PositionManager::new();
        let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
        let closed = m.close(&p.position_id, 110.0, 0.0, Utc::now()).unwrap();
        assert_eq!(closed.current_size, 0.0);
        assert!((closed.realized_pnl - 10.0).abs() < 1e-9);
        assert_eq!(closed.status, PositionStatus::Closed);
    }

    #[test]
    fn liquidate_forces_terminal_liquidated_status() {
        let m = PositionManager::new();
        let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
        let liquidated = m.liquidate(&p.position_id, 50.0, 0.0, Utc::now()).unwrap();
        assert_eq!(liquidated.current_size, 0.0);
        assert_eq!(liquidated.status, PositionStatus::Liquidated);
        assert!((liquidated.realized_pnl - (-50.0)).abs() < 1e-9);
        let archived = m.get(&p.position_id).expect("liquidated position stays queryable from archive");
        assert_eq!(archived.status, PositionStatus::Liquidated);
        assert!(m.liquidate(&p.position_id, 40.0, 0.0, Utc::now()).is_err());
    }

    #[test]
    fn add_recomputes_volume_weighted_entry() {
        let m = PositionManager::new();
        let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
        let p = m.add(&p.position_id, Fill::opening(110.0, 1.0, 0.0)).unwrap();
        assert!((p.average_entry_price - 105.0).abs() < 1e-9);
        assert_eq!(p.current_size, 2.0);
    }

    #[test]
    fn reduce_beyond_current_size_is_validation_error() {
        let m = PositionManager::new();
        let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
        let err = m.reduce(&p.position_id, Fill::closing(100.0, 2.0, 0.0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn mae_mfe_bounds_hold() {
        let m = PositionManager::new();
        let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
        let p = m.update_price(&p.position_id, 90.0, Utc::now()).unwrap();
        assert!(p.max_adverse_excursion <= 0.0);
        assert!(p.max_favorable_excursion >= 0.0);
        let p = m.update_price(&p.position_id, 120.0, Utc::now()).unwrap();
        assert!(p.max_favorable_excursion > 0.0);
    }

    #[test]
    fn percentage_trailing_stop_scenario_2() {
        // entry 100, trail 5%. Prices: 100, 110, 108, 104.5.
        // Stop trajectory: 95, 104.5, 104.5, triggered at 104.5.
        let mut stop = TrailingStop::percentage(100.0, true, 0.05);
        assert!((stop.stop_price() - 95.0).abs() < 1e-9);
        stop.update(true, 110.0, None);
        assert!((stop.stop_price() - 104.5).abs() < 1e-9);
        stop.update(true, 108.0, None);
        assert!((stop.stop_price() - 104.5).abs() < 1e-9);
        stop.update(true, 104.5, None);
        assert!(stop.should_trigger(true, 104.5));
    }

    #[test]
    fn trailing_stop_never_retreats_for_long() {
        let mut stop = TrailingStop::atr(100.0, true, 2.0, 1.0);
        let first = stop.update(true, 105.0, Some(1.0));
        let second = stop.update(true, 103.0, Some(1.0));
        assert!(second >= first);
    }

    #[test]
    fn ladder_equal_distribution_sums_to_total() {
        let ladder = Ladder::new("p1", true, true, 100.0, 10.0, 4, SizeDistribution::Equal, 0.01, None);
        let total: f64 = ladder.levels.iter().map(|l| l.size).sum();
        assert!((total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn scale_in_triggers_on_price_drop_for_long() {
        let ladder = Ladder::new("p1", true, true, 100.0, 10.0, 3, SizeDistribution::Equal, 0.01, None);
        let triggered = ladder.check_triggers(98.0);
        assert!(!triggered.is_empty());
    }

    #[test]
    fn hedge_net_exposure_subtracts_ratio_weighted_size() {
        let manager = PositionManager::new();
        let hedges = HedgeManager::new();
        let pos = manager.open(open_spec(Side::Long, 10.0, 100.0)).unwrap();
        hedges
            .create_hedge(&manager, &pos, HedgeKind::Partial, 0.5, "BTCUSDT", 100.0, 1.0)
            .unwrap();
        let net = hedges.net_exposure(10.0, &pos.position_id);
        assert!((net - 5.0).abs() < 1e-9);
    }

    #[test]
    fn exit_manager_sorts_triggered_by_priority() {
        let mut exits = ExitManager::new("p1", Utc::now());
        exits.add_profit_target(110.0, 0.5, 2);
        exits.add_max_holding(0.0, 1.0, 1);
        let triggered = exits.check(Utc::now() + chrono::Duration::seconds(1), 111.0, true);
        assert_eq!(triggered.len(), 2);
        assert_eq!(triggered[0].priority, 1);
    }

    proptest! {
        /// spec §8: "∀ position p, at all times current_size >= 0 and
        /// current_size = Σ opening_fills.size − Σ closing_fills.size" under
        /// any interleaving of scale-in/scale-out operations.
        #[test]
        fn current_size_invariant_holds_under_random_fills(
            initial in 1.0f64..50.0,
            ops in proptest::collection::vec((proptest::bool::ANY, 0.1f64..20.0), 0..20),
        ) {
            let m = PositionManager::new();
            let mut p = m.open(open_spec(Side::Long, initial, 100.0)).unwrap();
            for (is_add, size) in ops {
                if p.current_size <= 0.0 {
                    break;
                }
                let result = if is_add {
                    m.add(&p.position_id, Fill::opening(100.0, size, 0.0))
                } else {
                    let bounded = size.min(p.current_size);
                    m.reduce(&p.position_id, Fill::closing(100.0, bounded, 0.0))
                };
                if let Ok(updated) = result {
                    p = updated;
                }
                prop_assert!(p.current_size >= -1e-9);
            }
        }

        /// spec §8: MAE <= 0 <= MFE for every open position at every tick.
        #[test]
        fn mae_mfe_bounds_hold_under_random_price_walk(
            prices in proptest::collection::vec(50.0f64..200.0, 1..30),
        ) {
            let m = PositionManager::new();
            let p = m.open(open_spec(Side::Long, 1.0, 100.0)).unwrap();
            let mut last = p;
            for price in prices {
                last = m.update_price(&last.position_id, price, Utc::now()).unwrap();
                prop_assert!(last.max_adverse_excursion <= 1e-9);
                prop_assert!(last.max_favorable_excursion >= -1e-9);
            }
        }
    }
}
