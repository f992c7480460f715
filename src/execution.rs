// =============================================================================
// Execution Engine (C1) — slices parent orders by algorithm, routes slices
// across venues, tracks slippage vs. benchmarks (ExecutionPlan + Slice data
// model).
// =============================================================================
//
// Grounded on an `Arc`-composed engine struct with `ExecutionResult`-style
// outcomes, generalized per
// `examples/original_source/order_execution/{execution_algorithms,
// order_splitter,exchange_router,slippage_tracker}.py` for the exact slicing,
// splitting, routing and quality formulas.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Plan / Slice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionAlgorithm {
    Twap,
    Vwap,
    Pov,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub slice_id: String,
    pub quantity: f64,
    pub scheduled_time: DateTime<Utc>,
    pub status: SliceStatus,
    pub executed_price: Option<f64>,
    pub executed_quantity: f64,
    pub attempts: u32,
}

impl Slice {
    fn new(quantity: f64, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            slice_id: Uuid::new_v4().to_string(),
            quantity,
            scheduled_time,
            status: SliceStatus::Pending,
            executed_price: None,
            executed_quantity: 0.0,
            attempts: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SliceStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub total_quantity: f64,
    pub algorithm: ExecutionAlgorithm,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub slices: Vec<Slice>,
}

impl ExecutionPlan {
    pub fn average_execution_price(&self) -> f64 {
        let completed: Vec<&Slice> = self.slices.iter().filter(|s| s.is_complete()).collect();
        let total_qty: f64 = completed.iter().map(|s| s.executed_quantity).sum();
        if total_qty <= 0.0 {
            return 0.0;
        }
        completed.iter().map(|s| s.executed_price.unwrap_or(0.0) * s.executed_quantity).sum::<f64>() / total_qty
    }

    /// Fraction of `total_quantity` executed so far.
    pub fn completion_rate(&self) -> f64 {
        if self.total_quantity <= 0.0 {
            return 0.0;
        }
        let executed: f64 = self.slices.iter().filter(|s| s.is_complete()).map(|s| s.executed_quantity).sum();
        executed / self.total_quantity
    }

    /// Sums to `total_quantity` within rounding.
    pub fn total_sliced_quantity(&self) -> f64 {
        self.slices.iter().map(|s| s.quantity).sum()
    }
}

/// Reference sizing heuristic. Reproducible purely from inputs.
pub fn select_algorithm(order_size: f64, daily_volume: f64, urgency: f64) -> ExecutionAlgorithm {
    let order_pct = if daily_volume > 0.0 { order_size / daily_volume } else { 1.0 };
    if order_pct < 0.01 {
        ExecutionAlgorithm::Twap
    } else if order_pct < 0.05 {
        if urgency > 0.7 {
            ExecutionAlgorithm::Pov
        } else {
            ExecutionAlgorithm::Vwap
        }
    } else if urgency > 0.5 {
        ExecutionAlgorithm::Adaptive
    } else {
        ExecutionAlgorithm::Vwap
    }
}

// ---------------------------------------------------------------------------
// Slice generators
// ---------------------------------------------------------------------------

fn num_slices_for_duration(duration_minutes: f64) -> usize {
    (5.0_f64).max(duration_minutes / 5.0).round().max(5.0) as usize
}

/// `N = max(5, duration_min/5)`; equal size; evenly spaced.
pub fn generate_twap_slices(
    order_id: &str,
    symbol: &str,
    side: Side,
    total_quantity: f64,
    start_time: DateTime<Utc>,
    duration_minutes: f64,
) -> ExecutionPlan {
    let n = num_slices_for_duration(duration_minutes);
    let slice_qty = total_quantity / n as f64;
    let interval = duration_minutes / n as f64;
    let slices = (0..n)
        .map(|i| Slice::new(slice_qty, start_time + ChronoDuration::seconds((i as f64 * interval * 60.0) as i64)))
        .collect();
    ExecutionPlan {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        total_quantity,
        algorithm: ExecutionAlgorithm::Twap,
        start_time,
        end_time: start_time + ChronoDuration::seconds((duration_minutes * 60.0) as i64),
        slices,
    }
}

/// Default U-shaped volume profile: higher at open/close, lower mid-period.
pub fn default_u_shape_profile(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let distance_from_center = (2.0 * i as f64 / n as f64 - 1.0).abs();
            0.5 + 0.5 * distance_from_center
        })
        .collect()
}

/// Identical time spacing to TWAP; sizes proportional to a normalized volume
/// profile. Falls back to the default U-shape when the supplied profile is
/// all-zero.
pub fn generate_vwap_slices(
    order_id: &str,
    symbol: &str,
    side: Side,
    total_quantity: f64,
    start_time: DateTime<Utc>,
    duration_minutes: f64,
    volume_profile: Option<Vec<f64>>,
) -> ExecutionPlan {
    let n = num_slices_for_duration(duration_minutes);
    let raw = match volume_profile {
        Some(p) if p.iter().take(n).any(|v| *v > 0.0) => {
            let mut p = p;
            p.resize(n, 0.0);
            p
        }
        _ => default_u_shape_profile(n),
    };
    let sum: f64 = raw.iter().sum();
    let normalized: Vec<f64> = if sum > 0.0 { raw.iter().map(|v| v / sum).collect() } else { vec![1.0 / n as f64; n] };
    let interval = duration_minutes / n as f64;
    let slices = normalized
        .into_iter()
        .enumerate()
        .map(|(i, w)| Slice::new(total_quantity * w, start_time + ChronoDuration::seconds((i as f64 * interval * 60.0) as i64)))
        .collect();
    ExecutionPlan {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        total_quantity,
        algorithm: ExecutionAlgorithm::Vwap,
        start_time,
        end_time: start_time + ChronoDuration::seconds((duration_minutes * 60.0) as i64),
        slices,
    }
}

/// `raw = participation_rate * market_volume`, rescaled so `Σ = total`.
pub fn generate_pov_slices(
    order_id: &str,
    symbol: &str,
    side: Side,
    total_quantity: f64,
    start_time: DateTime<Utc>,
    duration_minutes: f64,
    participation_rate: f64,
    expected_market_volumes: &[f64],
) -> ExecutionPlan {
    let n = expected_market_volumes.len().max(1);
    let raw: Vec<f64> = expected_market_volumes.iter().map(|v| v * participation_rate).collect();
    let total_generated: f64 = raw.iter().sum();
    let scale = if total_generated > 0.0 { total_quantity / total_generated } else { 0.0 };
    let interval = duration_minutes / n as f64;
    let slices = raw
        .into_iter()
        .enumerate()
        .map(|(i, q)| Slice::new(q * scale, start_time + ChronoDuration::seconds((i as f64 * interval * 60.0) as i64)))
        .collect();
    ExecutionPlan {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        total_quantity,
        algorithm: ExecutionAlgorithm::Pov,
        start_time,
        end_time: start_time + ChronoDuration::seconds((duration_minutes * 60.0) as i64),
        slices,
    }
}

/// Adaptive execution state. Starts equal-weighted; `adapt` reacts to
/// schedule shortfall, volatility, and spread.
#[derive(Debug, Clone)]
pub struct AdaptiveExecutor {
    pub plan: ExecutionPlan,
    pub urgency: f64,
    pub adjustment_factor: f64,
}

impl AdaptiveExecutor {
    pub fn new(
        order_id: &str,
        symbol: &str,
        side: Side,
        total_quantity: f64,
        start_time: DateTime<Utc>,
        duration_minutes: f64,
        initial_slices: usize,
        urgency: f64,
    ) -> Self {
        let n = initial_slices.max(1);
        let slice_qty = total_quantity / n as f64;
        let interval = duration_minutes / n as f64;
        let slices = (0..n)
            .map(|i| Slice::new(slice_qty, start_time + ChronoDuration::seconds((i as f64 * interval * 60.0) as i64)))
            .collect();
        let plan = ExecutionPlan {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            total_quantity,
            algorithm: ExecutionAlgorithm::Adaptive,
            start_time,
            end_time: start_time + ChronoDuration::seconds((duration_minutes * 60.0) as i64),
            slices,
        };
        Self { plan, urgency, adjustment_factor: 1.0 }
    }

    /// (a) raises urgency when behind schedule, (b) shrinks slices in high
    /// volatility, (c) lowers urgency in wide-spread regimes.
    pub fn adapt(&mut self, volatility: f64, spread_bps: f64, execution_shortfall: f64) {
        if execution_shortfall < -0.05 {
            self.urgency = (self.urgency + 0.1).min(1.0);
        }
        if volatility > 0.03 {
            self.adjustment_factor = 0.8;
        } else if volatility < 0.01 {
            self.adjustment_factor = 1.2;
        }
        if spread_bps > 50.0 {
            self.urgency = (self.urgency - 0.1).max(0.0);
        }
    }

    /// `(remaining / remaining_slices) * urgency * adjustment` — the design
    /// note's intentional deviation from this module's analogue (which never
    /// reads its own `adjustment_factor`); this port reads it.
    pub fn next_slice_size(&self) -> f64 {
        let executed: f64 = self.plan.slices.iter().filter(|s| s.is_complete()).map(|s| s.executed_quantity).sum();
        let remaining_quantity = self.plan.total_quantity - executed;
        let remaining_slices = self.plan.slices.iter().filter(|s| !s.is_complete()).count();
        if remaining_slices == 0 {
            return 0.0;
        }
        let base = remaining_quantity / remaining_slices as f64;
        (base * self.urgency * self.adjustment_factor).min(remaining_quantity).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Order splitter (strategy-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Equal,
    Random,
    Exponential,
}

pub fn split_order(total: f64, n: usize, strategy: SplitStrategy) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    match strategy {
        SplitStrategy::Equal => vec![total / n as f64; n],
        SplitStrategy::Random => {
            let mut rng = rand::thread_rng();
            use rand::Rng;
            let weights: Vec<f64> = (0..n).map(|_| rng.gen_range(0.01..1.0)).collect();
            let sum: f64 = weights.iter().sum();
            weights.into_iter().map(|w| w / sum * total).collect()
        }
        SplitStrategy::Exponential => {
            let weights: Vec<f64> = (0..n).map(|i| 2f64.powi(-(i as i32))).collect();
            let sum: f64 = weights.iter().sum();
            weights.into_iter().map(|w| w / sum * total).collect()
        }
    }
}

/// Shows a small visible quantity at a time, hiding the bulk, until
/// `filled >= total`.
#[derive(Debug, Clone)]
pub struct Iceberg {
    pub total_quantity: f64,
    pub visible_quantity: f64,
    pub filled_quantity: f64,
}

impl Iceberg {
    pub fn new(total_quantity: f64, visible_quantity: f64) -> Self {
        Self { total_quantity, visible_quantity, filled_quantity: 0.0 }
    }

    pub fn next_visible_slice(&self) -> Option<f64> {
        if self.filled_quantity >= self.total_quantity {
            return None;
        }
        Some(self.visible_quantity.min(self.total_quantity - self.filled_quantity))
    }

    pub fn mark_filled(&mut self, quantity: f64) {
        self.filled_quantity += quantity;
    }

    pub fn is_complete(&self) -> bool {
        self.filled_quantity >= self.total_quantity
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    BestPrice,
    BestLiquidity,
    LowestFee,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeQuote {
    pub exchange: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub fee_bps: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub exchange: String,
    pub expected_price: f64,
    pub expected_fee_bps: f64,
    pub liquidity_score: f64,
    pub allocated_quantity: f64,
    pub reason: String,
}

fn taking_price(q: &ExchangeQuote, side: Side) -> f64 {
    if side.is_long() { q.ask } else { q.bid }
}

fn taking_size(q: &ExchangeQuote, side: Side) -> f64 {
    if side.is_long() { q.ask_size } else { q.bid_size }
}

fn normalize(value: f64, min: f64, max: f64, invert: bool) -> f64 {
    let span = (max - min).max(1e-8);
    let raw = (value - min) / span * 100.0;
    if invert { 100.0 - raw } else { raw }
}

pub struct Router {
    pub strategy: RoutingStrategy,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self { strategy }
    }

    fn select_single(&self, quotes: &[ExchangeQuote], side: Side, quantity: f64) -> Option<&ExchangeQuote> {
        if quotes.is_empty() {
            return None;
        }
        match self.strategy {
            RoutingStrategy::BestPrice => quotes.iter().min_by(|a, b| {
                taking_price(a, side).partial_cmp(&taking_price(b, side)).unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| if side.is_long() { std::cmp::Ordering::Equal } else { std::cmp::Ordering::Equal })
            }).map(|q| if side.is_long() { q } else {
                quotes.iter().max_by(|a, b| a.bid.partial_cmp(&b.bid).unwrap_or(std::cmp::Ordering::Equal)).unwrap()
            }),
            RoutingStrategy::BestLiquidity => {
                let covering: Vec<&ExchangeQuote> = quotes.iter().filter(|q| taking_size(q, side) >= quantity).collect();
                let pool: Vec<&ExchangeQuote> = if covering.is_empty() { quotes.iter().collect() } else { covering };
                pool.into_iter().max_by(|a, b| taking_size(a, side).partial_cmp(&taking_size(b, side)).unwrap_or(std::cmp::Ordering::Equal))
            }
            RoutingStrategy::LowestFee => quotes.iter().min_by(|a, b| a.fee_bps.partial_cmp(&b.fee_bps).unwrap_or(std::cmp::Ordering::Equal)),
            RoutingStrategy::Balanced => {
                let prices: Vec<f64> = quotes.iter().map(|q| taking_price(q, side)).collect();
                let fees: Vec<f64> = quotes.iter().map(|q| q.fee_bps).collect();
                let (pmin, pmax) = (prices.iter().cloned().fold(f64::MAX, f64::min), prices.iter().cloned().fold(f64::MIN, f64::max));
                let (fmin, fmax) = (fees.iter().cloned().fold(f64::MAX, f64::min), fees.iter().cloned().fold(f64::MIN, f64::max));
                quotes
                    .iter()
                    .map(|q| {
                        let price_score = normalize(taking_price(q, side), pmin, pmax, side.is_long());
                        let liquidity_score = (taking_size(q, side) / quantity.max(1e-9) * 100.0).min(100.0);
                        let fee_score = normalize(q.fee_bps, fmin, fmax, true);
                        let total = 0.5 * price_score + 0.3 * liquidity_score + 0.2 * fee_score;
                        (total, q)
                    })
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(_, q)| q)
            }
        }
    }

    /// Single-venue routing decision.
    pub fn route(&self, quotes: &[ExchangeQuote], side: Side, quantity: f64) -> Option<RoutingDecision> {
        let selected = self.select_single(quotes, side, quantity)?;
        Some(RoutingDecision {
            exchange: selected.exchange.clone(),
            expected_price: taking_price(selected, side),
            expected_fee_bps: selected.fee_bps,
            liquidity_score: (taking_size(selected, side) / quantity.max(1e-9) * 100.0).min(100.0),
            allocated_quantity: quantity,
            reason: format!("{:?} strategy", self.strategy),
        })
    }

    /// Sorts quotes by price on the taking side, greedily allocates across
    /// venues until `quantity` is satisfied.
    pub fn route_with_splits(&self, quotes: &[ExchangeQuote], side: Side, total_quantity: f64) -> Vec<RoutingDecision> {
        let mut sorted: Vec<&ExchangeQuote> = quotes.iter().collect();
        sorted.sort_by(|a, b| {
            let pa = taking_price(a, side);
            let pb = taking_price(b, side);
            if side.is_long() {
                pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
            } else {
                pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        let mut remaining = total_quantity;
        let mut decisions = Vec::new();
        for q in sorted {
            if remaining <= 0.0 {
                break;
            }
            let available = taking_size(q, side);
            let allocated = remaining.min(available);
            if allocated > 0.0 {
                decisions.push(RoutingDecision {
                    exchange: q.exchange.clone(),
                    expected_price: taking_price(q, side),
                    expected_fee_bps: q.fee_bps,
                    liquidity_score: (allocated / total_quantity.max(1e-9) * 100.0).min(100.0),
                    allocated_quantity: allocated,
                    reason: format!("split routing ({allocated}/{total_quantity})"),
                });
                remaining -= allocated;
            }
        }
        decisions
    }
}

// ---------------------------------------------------------------------------
// Slippage tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageMetrics {
    pub avg_execution_price: f64,
    pub slippage_bps: f64,
    pub market_impact_bps: Option<f64>,
}

pub fn compute_slippage(side: Side, fills: &[(f64, f64)], arrival_price: f64, benchmark: Option<f64>) -> SlippageMetrics {
    let total_qty: f64 = fills.iter().map(|(_, q)| q).sum();
    let avg = if total_qty > 0.0 {
        fills.iter().map(|(p, q)| p * q).sum::<f64>() / total_qty
    } else {
        0.0
    };
    let slippage_bps = if arrival_price.abs() > f64::EPSILON {
        side.sign() * (avg - arrival_price) / arrival_price * 10000.0
    } else {
        0.0
    };
    let market_impact_bps = benchmark.map(|b| {
        if b.abs() > f64::EPSILON {
            side.sign() * (avg - b) / b * 10000.0
        } else {
            0.0
        }
    });
    SlippageMetrics { avg_execution_price: avg, slippage_bps, market_impact_bps }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionQuality {
    pub price_quality: f64,
    pub speed_quality: f64,
    pub fill_quality: f64,
    pub overall_quality: f64,
}

/// price: signed linear scale, 100 at 0bps down to 0 at >=50bps of adverse
/// slippage; favorable (negative) slippage clamps at 100, never penalized.
/// speed: 100 if actual <= expected, 0 at 2x. fill: fill_rate*100.
/// overall = 0.5p + 0.3s + 0.2f.
pub fn assess_execution_quality(
    slippage_bps: f64,
    expected_duration_secs: f64,
    actual_duration_secs: f64,
    fill_rate: f64,
) -> ExecutionQuality {
    let price_quality = (100.0 - (slippage_bps / 50.0) * 100.0).clamp(0.0, 100.0);
    let speed_ratio = if expected_duration_secs > 0.0 { actual_duration_secs / expected_duration_secs } else { 1.0 };
    let speed_quality = if speed_ratio <= 1.0 {
        100.0
    } else if speed_ratio >= 2.0 {
        0.0
    } else {
        100.0 - (speed_ratio - 1.0) * 100.0
    };
    let fill_quality = (fill_rate * 100.0).clamp(0.0, 100.0);
    let overall = 0.5 * price_quality + 0.3 * speed_quality + 0.2 * fill_quality;
    ExecutionQuality { price_quality, speed_quality, fill_quality, overall_quality: overall }
}

// ---------------------------------------------------------------------------
// Plan-level failure semantics
// ---------------------------------------------------------------------------

/// A slice that fails is retried once; two failures mark it `failed`. The
/// plan continues unless completion at expiration is below 50%.
pub fn record_slice_failure(plan: &mut ExecutionPlan, slice_id: &str) -> CoreResult<bool> {
    let Some(slice) = plan.slices.iter_mut().find(|s| s.slice_id == slice_id) else {
        return Err(CoreError::validation(format!("unknown slice {slice_id}")));
    };
    slice.attempts += 1;
    if slice.attempts >= 2 {
        slice.status = SliceStatus::Failed;
        Ok(true)
    } else {
        slice.status = SliceStatus::Pending;
        Ok(false)
    }
}

pub fn record_slice_fill(plan: &mut ExecutionPlan, slice_id: &str, price: f64, quantity: f64) -> CoreResult<()> {
    let Some(slice) = plan.slices.iter_mut().find(|s| s.slice_id == slice_id) else {
        return Err(CoreError::validation(format!("unknown slice {slice_id}")));
    };
    if slice.status == SliceStatus::Completed {
        return Err(CoreError::logic("completed slices never mutate"));
    }
    slice.executed_price = Some(price);
    slice.executed_quantity = quantity;
    slice.status = SliceStatus::Completed;
    Ok(())
}

/// Evaluated at plan expiration: surfaces a `partial_execution` error when
/// completion is below 50%.
pub fn check_plan_completion(plan: &ExecutionPlan) -> CoreResult<()> {
    if plan.completion_rate() < 0.5 {
        return Err(CoreError::exchange(format!(
            "partial_execution: plan {} completed {:.1}%",
            plan.order_id,
            plan.completion_rate() * 100.0
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn twap_split_scenario_1() {
        // total=100, duration=30min => N=6, size~16.6667, spaced 5 min apart.
        let start = Utc::now();
        let plan = generate_twap_slices("o1", "BTCUSDT", Side::Long, 100.0, start, 30.0);
        assert_eq!(plan.slices.len(), 6);
        for s in &plan.slices {
            assert!((s.quantity - 100.0 / 6.0).abs() < 1e-6);
        }
        let expected_offsets = [0, 5, 10, 15, 20, 25];
        for (s, off) in plan.slices.iter().zip(expected_offsets) {
            assert_eq!((s.scheduled_time - start).num_minutes(), off);
        }
    }

    #[test]
    fn plan_quantity_conserved_within_rounding() {
        let plan = generate_twap_slices("o1", "ETHUSDT", Side::Long, 100.0, Utc::now(), 30.0);
        assert!((plan.total_sliced_quantity() - plan.total_quantity).abs() < 1e-6);
    }

    #[test]
    fn vwap_falls_back_to_u_shape_on_all_zero_profile() {
        let plan = generate_vwap_slices(
            "o1", "BTCUSDT", Side::Long, 100.0, Utc::now(), 30.0, Some(vec![0.0; 6]),
        );
        assert!((plan.total_sliced_quantity() - 100.0).abs() < 1e-6);
        // U-shape: first slice should be heavier than the middle slice.
        assert!(plan.slices[0].quantity > plan.slices[3].quantity);
    }

    #[test]
    fn adaptive_zero_remaining_slices_returns_zero() {
        let mut exec = AdaptiveExecutor::new("o1", "BTCUSDT", Side::Long, 10.0, Utc::now(), 10.0, 2, 0.5);
        for s in exec.plan.slices.iter_mut() {
            s.status = SliceStatus::Completed;
            s.executed_quantity = s.quantity;
        }
        assert_eq!(exec.next_slice_size(), 0.0);
    }

    #[test]
    fn select_algorithm_matches_reference_heuristic() {
        assert_eq!(select_algorithm(1_000.0, 1_000_000.0, 0.2), ExecutionAlgorithm::Twap);
        assert_eq!(select_algorithm(30_000.0, 1_000_000.0, 0.8), ExecutionAlgorithm::Pov);
        assert_eq!(select_algorithm(30_000.0, 1_000_000.0, 0.2), ExecutionAlgorithm::Vwap);
        assert_eq!(select_algorithm(100_000.0, 1_000_000.0, 0.6), ExecutionAlgorithm::Adaptive);
    }

    fn quote(exchange: &str, bid: f64, ask: f64, bid_size: f64, ask_size: f64, fee_bps: f64) -> ExchangeQuote {
        ExchangeQuote { exchange: exchange.to_string(), bid, ask, bid_size, ask_size, fee_bps, latency_ms: 10.0 }
    }

    #[test]
    fn router_best_price_picks_lowest_ask_for_buy() {
        let quotes = vec![quote("a", 99.0, 101.0, 10.0, 10.0, 5.0), quote("b", 99.0, 100.0, 10.0, 10.0, 8.0)];
        let router = Router::new(RoutingStrategy::BestPrice);
        let decision = router.route(&quotes, Side::Long, 5.0).unwrap();
        assert_eq!(decision.exchange, "b");
    }

    #[test]
    fn router_split_allocates_across_venues() {
        let quotes = vec![quote("a", 99.0, 100.0, 10.0, 4.0, 5.0), quote("b", 99.0, 100.5, 10.0, 10.0, 5.0)];
        let router = Router::new(RoutingStrategy::Balanced);
        let decisions = router.route_with_splits(&quotes, Side::Long, 8.0);
        let total: f64 = decisions.iter().map(|d| d.allocated_quantity).sum();
        assert!((total - 8.0).abs() < 1e-9);
        assert_eq!(decisions[0].exchange, "a");
    }

    #[test]
    fn slippage_sign_matches_side() {
        let metrics = compute_slippage(Side::Long, &[(101.0, 1.0)], 100.0, None);
        assert!(metrics.slippage_bps > 0.0);
        let metrics = compute_slippage(Side::Short, &[(99.0, 1.0)], 100.0, None);
        assert!(metrics.slippage_bps > 0.0);
    }

    #[test]
    fn quality_scores_within_bounds() {
        let q = assess_execution_quality(4.0, 60.0, 60.0, 1.0);
        assert!((q.price_quality - 92.0).abs() < 1e-6);
        assert_eq!(q.speed_quality, 100.0);
        assert_eq!(q.fill_quality, 100.0);
    }

    #[test]
    fn favorable_slippage_clamps_price_quality_to_100() {
        // negative slippage (execution better than arrival) must never be
        // penalized: it clamps at the 100 ceiling, not abs()-penalized.
        let q = assess_execution_quality(-30.0, 60.0, 60.0, 1.0);
        assert_eq!(q.price_quality, 100.0);
    }

    #[test]
    fn two_failures_mark_slice_failed() {
        let mut plan = generate_twap_slices("o1", "BTCUSDT", Side::Long, 10.0, Utc::now(), 30.0);
        let id = plan.slices[0].slice_id.clone();
        assert!(!record_slice_failure(&mut plan, &id).unwrap());
        assert!(record_slice_failure(&mut plan, &id).unwrap());
        assert_eq!(plan.slices[0].status, SliceStatus::Failed);
    }

    #[test]
    fn below_half_completion_surfaces_partial_execution_error() {
        let plan = generate_twap_slices("o1", "BTCUSDT", Side::Long, 10.0, Utc::now(), 30.0);
        let err = check_plan_completion(&plan).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Exchange);
    }

    #[test]
    fn iceberg_emits_visible_slices_until_filled() {
        let mut iceberg = Iceberg::new(10.0, 3.0);
        let mut total = 0.0;
        while let Some(qty) = iceberg.next_visible_slice() {
            iceberg.mark_filled(qty);
            total += qty;
        }
        assert!((total - 10.0).abs() < 1e-9);
        assert!(iceberg.is_complete());
    }

    #[test]
    fn split_order_equal_sums_to_total() {
        let parts = split_order(100.0, 4, SplitStrategy::Equal);
        assert!((parts.iter().sum::<f64>() - 100.0).abs() < 1e-9);
    }

    proptest! {
        /// spec §8: "∀ execution plan pl, Σ slice.quantity = pl.total_quantity
        /// within floating-point rounding, and scheduled_time is non-decreasing."
        #[test]
        fn twap_plan_conserves_quantity_and_time_order(
            total in 1.0f64..10_000.0,
            duration in 5.0f64..240.0,
        ) {
            let plan = generate_twap_slices("o1", "BTCUSDT", Side::Long, total, Utc::now(), duration);
            prop_assert!((plan.total_sliced_quantity() - total).abs() < 1e-6);
            prop_assert!(plan.slices.windows(2).all(|w| w[1].scheduled_time >= w[0].scheduled_time));
        }

        #[test]
        fn vwap_plan_conserves_quantity_for_arbitrary_profile(
            total in 1.0f64..10_000.0,
            profile in proptest::collection::vec(0.0f64..100.0, 5..12),
        ) {
            let plan = generate_vwap_slices("o1", "BTCUSDT", Side::Long, total, Utc::now(), 30.0, Some(profile));
            prop_assert!((plan.total_sliced_quantity() - total).abs() < 1e-6);
        }

        #[test]
        fn split_order_strategies_conserve_total(
            total in 1.0f64..10_000.0,
            n in 1usize..10,
        ) {
            for strategy in [SplitStrategy::Equal, SplitStrategy::Exponential] {
                let parts = split_order(total, n, strategy);
                prop_assert!((parts.iter().sum::<f64>() - total).abs() < 1e-6);
            }
        }
    }
}
