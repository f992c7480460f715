// =============================================================================
// Strategy Activation & Learning (C5) — regime-aware activation decisions,
// genetic strategy synthesis, and chi-square A/B testing.
// =============================================================================
//
// Grounded on `regime/detector.rs` for the live classifier shape (kept
// distinct from `backtest::label_regime`, which is a cheaper parallel
// labeler for simulation use), and on
// `examples/original_source/strategy_service/{enhanced_strategy_activation,
// ml_models/strategy_learner}.py` for the six-step activation procedure and
// the genetic-synthesis/pattern-reward learning loop. The chi-square A/B
// submodule is grounded on
// `examples/original_source/strategy_versioning/{ab_testing,
// statistical_tests}.py`, using `statrs` for the distribution (the crate
// `cooprefr-bettersys` reaches for in its own Cargo.toml).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::types::ALL_REGIMES;
pub use crate::types::{Regime, StrategyType};

// ---------------------------------------------------------------------------
// Market conditions / strategy record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditions {
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
    pub volatility: f64,
    pub trend_strength: f64,
    pub volume_trend: f64,
    pub sentiment_score: f64,
    pub fear_greed_index: f64,
    pub btc_correlation: f64,
    pub liquidity: f64,
    pub macro_score: f64,
}

impl MarketConditions {
    /// Standardized-Euclidean-distance feature vector (spec's 8 features).
    pub fn feature_vector(&self) -> [f64; 8] {
        [
            self.volatility,
            self.trend_strength,
            self.volume_trend,
            self.sentiment_score,
            self.fear_greed_index,
            self.btc_correlation,
            self.liquidity,
            self.macro_score,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Active,
    Kept,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub strategy_type: StrategyType,
    pub parameters: HashMap<String, f64>,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub status: StrategyStatus,
    pub regime_preferences: Vec<Regime>,
}

/// One realized trade used as a historical training/evaluation sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalTrade {
    pub strategy_id: String,
    pub conditions: MarketConditions,
    pub return_pct: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// k-NN historical similarity
// ---------------------------------------------------------------------------

fn standardize(samples: &[[f64; 8]]) -> ([f64; 8], [f64; 8]) {
    let n = samples.len().max(1) as f64;
    let mut mean = [0.0; 8];
    for s in samples {
        for i in 0..8 {
            mean[i] += s[i];
        }
    }
    for m in mean.iter_mut() {
        *m /= n;
    }
    let mut stdev = [0.0; 8];
    for s in samples {
        for i in 0..8 {
            stdev[i] += (s[i] - mean[i]).powi(2);
        }
    }
    for s in stdev.iter_mut() {
        *s = (*s / n).sqrt();
        if *s < 1e-9 {
            *s = 1.0;
        }
    }
    (mean, stdev)
}

fn standardized_distance(a: &[f64; 8], b: &[f64; 8], mean: &[f64; 8], stdev: &[f64; 8]) -> f64 {
    (0..8)
        .map(|i| {
            let za = (a[i] - mean[i]) / stdev[i];
            let zb = (b[i] - mean[i]) / stdev[i];
            (za - zb).powi(2)
        })
        .sum::<f64>()
        .sqrt()
}

/// Finds the `k` historical trades whose conditions are nearest to `current`
/// by standardized Euclidean distance, along with an average similarity in
/// `[0, 1]` (`1 / (1 + mean_distance)`).
pub fn k_nearest_neighbors<'a>(
    current: &MarketConditions,
    history: &'a [HistoricalTrade],
    k: usize,
) -> (Vec<&'a HistoricalTrade>, f64) {
    if history.is_empty() {
        return (Vec::new(), 0.0);
    }
    let vectors: Vec<[f64; 8]> = history.iter().map(|h| h.conditions.feature_vector()).collect();
    let (mean, stdev) = standardize(&vectors);
    let current_vec = current.feature_vector();

    let mut scored: Vec<(f64, &HistoricalTrade)> = history
        .iter()
        .zip(vectors.iter())
        .map(|(h, v)| (standardized_distance(&current_vec, v, &mean, &stdev), h))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k.max(1));

    let mean_distance = scored.iter().map(|(d, _)| d).sum::<f64>() / scored.len() as f64;
    let similarity = 1.0 / (1.0 + mean_distance);
    (scored.into_iter().map(|(_, h)| h).collect(), similarity)
}

// ---------------------------------------------------------------------------
// Historical performance evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HistoricalPerformance {
    pub sharpe: f64,
    pub win_rate: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub consistency: f64,
    pub trade_count: usize,
}

/// Consistency = `positive_ratio * (1 - min(1, stdev/0.1))` — rewards
/// strategies whose winners aren't the product of a handful of outliers.
pub fn evaluate_historical_performance(trades: &[&HistoricalTrade]) -> HistoricalPerformance {
    if trades.is_empty() {
        return HistoricalPerformance::default();
    }
    let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
    let wins = returns.iter().filter(|r| **r > 0.0).count();
    let win_rate = wins as f64 / returns.len() as f64;

    let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r <= 0.0).map(|r| r.abs()).sum();
    let profit_factor = if gross_loss > 0.0 { gross_profit / gross_loss } else { gross_profit };

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let stdev = variance.sqrt();
    let sharpe = if stdev > 1e-9 { mean / stdev * (returns.len() as f64).sqrt() } else { 0.0 };

    let positive_ratio = win_rate;
    let consistency = positive_ratio * (1.0 - (stdev / 0.1).min(1.0));

    let mut equity = 100.0;
    let mut peak = equity;
    let mut max_drawdown_pct = 0.0;
    for r in &returns {
        equity *= 1.0 + r / 100.0;
        if equity > peak {
            peak = equity;
        }
        let dd = if peak > 0.0 { (peak - equity) / peak * 100.0 } else { 0.0 };
        if dd > max_drawdown_pct {
            max_drawdown_pct = dd;
        }
    }

    HistoricalPerformance { sharpe, win_rate, max_drawdown_pct, profit_factor, consistency, trade_count: trades.len() }
}

// ---------------------------------------------------------------------------
// Regime suitability table + sentiment alignment
// ---------------------------------------------------------------------------

/// Fixed lookup: how well a strategy family historically performs under a
/// regime, in `[0, 1]`. Conservative defaults; tuned strategies can override
/// via `regime_preferences` boosting their own regime to `1.0`.
pub fn regime_suitability(strategy_type: StrategyType, regime: Regime) -> f64 {
    use Regime::*;
    use StrategyType::*;
    match (strategy_type, regime) {
        (TrendFollowing | Momentum, BullTrending | BearTrending) => 0.9,
        (TrendFollowing | Momentum, SidewaysRange) => 0.3,
        (MeanReversion | Swing, SidewaysRange | LowVolatility) => 0.9,
        (MeanReversion | Swing, HighVolatility | Crisis) => 0.3,
        (Breakout | Scalping, HighVolatility) => 0.85,
        (Breakout | Scalping, LowVolatility) => 0.35,
        (Arbitrage, _) => 0.6,
        (Hybrid, Recovery) => 0.8,
        (_, Crisis) => 0.2,
        _ => 0.5,
    }
}

/// Sentiment-alignment score blending recent symbol (0.6) and global (0.4)
/// sentiment, decayed toward 0 as the reading goes stale.
pub fn sentiment_alignment(symbol_sentiment: Option<(f64, f64)>, global_sentiment: Option<(f64, f64)>) -> f64 {
    let decay = |score: f64, age_hours: f64| {
        let freshness = (1.0 - age_hours / 48.0).clamp(0.0, 1.0);
        score * freshness
    };
    let sym = symbol_sentiment.map(|(s, age)| decay(s, age));
    let glob = global_sentiment.map(|(s, age)| decay(s, age));
    match (sym, glob) {
        (Some(s), Some(g)) => 0.6 * s + 0.4 * g,
        (Some(s), None) => s,
        (None, Some(g)) => g,
        (None, None) => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Activation engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActivationThresholds {
    pub min_historical_trades: usize,
    pub min_condition_similarity: f64,
    pub min_alignment: f64,
    pub min_expected_sharpe: f64,
    pub strong_expected_sharpe: f64,
    pub max_active_strategies: usize,
}

impl Default for ActivationThresholds {
    fn default() -> Self {
        Self {
            min_historical_trades: 20,
            min_condition_similarity: 0.7,
            min_alignment: 0.45,
            min_expected_sharpe: 1.0,
            strong_expected_sharpe: 1.5,
            max_active_strategies: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationDecision {
    pub strategy_id: String,
    pub status: StrategyStatus,
    pub expected_sharpe: f64,
    pub condition_similarity: f64,
    pub alignment: f64,
    pub reason: String,
}

pub struct ActivationEngine {
    thresholds: ActivationThresholds,
}

impl ActivationEngine {
    pub fn new(thresholds: ActivationThresholds) -> Self {
        Self { thresholds }
    }

    /// Steps 2-5 of the activation procedure for a single candidate
    /// strategy. Step 1 (regime classification, cooldown gating) and step 6
    /// (concurrency cap across the whole candidate set) are the caller's
    /// responsibility since they operate across strategies, not within one.
    pub fn evaluate_candidate(
        &self,
        strategy: &StrategyRecord,
        current_conditions: &MarketConditions,
        history: &[HistoricalTrade],
        symbol_sentiment: Option<(f64, f64)>,
        global_sentiment: Option<(f64, f64)>,
        k: usize,
    ) -> ActivationDecision {
        let strategy_history: Vec<HistoricalTrade> =
            history.iter().filter(|h| h.strategy_id == strategy.id).cloned().collect();

        let (neighbors, similarity) = k_nearest_neighbors(current_conditions, &strategy_history, k);
        let performance = evaluate_historical_performance(&neighbors);
        let suitability = regime_suitability(strategy.strategy_type, current_conditions.regime);
        let alignment = sentiment_alignment(symbol_sentiment, global_sentiment);

        let expected_sharpe = performance.sharpe * suitability;

        if performance.trade_count < self.thresholds.min_historical_trades {
            return ActivationDecision {
                strategy_id: strategy.id.clone(),
                status: StrategyStatus::Kept,
                expected_sharpe,
                condition_similarity: similarity,
                alignment,
                reason: format!("insufficient historical trades ({} < {})", performance.trade_count, self.thresholds.min_historical_trades),
            };
        }

        if similarity < self.thresholds.min_condition_similarity
            || alignment < self.thresholds.min_alignment
            || expected_sharpe < self.thresholds.min_expected_sharpe
        {
            return ActivationDecision {
                strategy_id: strategy.id.clone(),
                status: StrategyStatus::Deactivated,
                expected_sharpe,
                condition_similarity: similarity,
                alignment,
                reason: "below activation thresholds".to_string(),
            };
        }

        let status = if expected_sharpe >= self.thresholds.strong_expected_sharpe {
            StrategyStatus::Active
        } else {
            StrategyStatus::Kept
        };

        ActivationDecision {
            strategy_id: strategy.id.clone(),
            status,
            expected_sharpe,
            condition_similarity: similarity,
            alignment,
            reason: if status == StrategyStatus::Active { "strong expected sharpe".to_string() } else { "marginal, kept".to_string() },
        }
    }

    /// Step 6: caps concurrently active strategies, downgrading surplus
    /// `Active` decisions (lowest expected Sharpe first) to `Kept`.
    pub fn apply_concurrency_cap(&self, decisions: &mut [ActivationDecision]) {
        let mut active_indices: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.status == StrategyStatus::Active)
            .map(|(i, _)| i)
            .collect();
        if active_indices.len() <= self.thresholds.max_active_strategies {
            return;
        }
        active_indices.sort_by(|&a, &b| {
            decisions[b].expected_sharpe.partial_cmp(&decisions[a].expected_sharpe).unwrap_or(std::cmp::Ordering::Equal)
        });
        for &idx in active_indices.iter().skip(self.thresholds.max_active_strategies) {
            decisions[idx].status = StrategyStatus::Kept;
            decisions[idx].reason = "downgraded: concurrent-active cap reached".to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// Learning: statistical aggregation + pattern reward/penalty
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub trade_count: usize,
    pub avg_return_pct: f64,
    pub avg_sharpe: f64,
}

/// Aggregates backtest results by `(strategy_type, timeframe)`.
pub fn aggregate_by_strategy_timeframe(
    results: &[(StrategyType, String, f64, f64)],
) -> HashMap<(StrategyType, String), AggregateStats> {
    let mut groups: HashMap<(StrategyType, String), Vec<(f64, f64)>> = HashMap::new();
    for (strategy_type, timeframe, return_pct, sharpe) in results {
        groups.entry((*strategy_type, timeframe.clone())).or_default().push((*return_pct, *sharpe));
    }
    groups
        .into_iter()
        .map(|(key, values)| {
            let n = values.len();
            let avg_return_pct = values.iter().map(|(r, _)| r).sum::<f64>() / n as f64;
            let avg_sharpe = values.iter().map(|(_, s)| s).sum::<f64>() / n as f64;
            (key, AggregateStats { trade_count: n, avg_return_pct, avg_sharpe })
        })
        .collect()
}

/// Pattern key: `type_timeframe_indicators`. Winners add `sharpe*return` to
/// the pattern score; losers subtract `|return|`.
pub fn pattern_key(strategy_type: StrategyType, timeframe: &str, indicators: &[String]) -> String {
    format!("{strategy_type}_{timeframe}_{}", indicators.join("-"))
}

pub fn apply_pattern_reward(scores: &mut HashMap<String, f64>, key: &str, sharpe: f64, return_pct: f64) {
    let delta = if return_pct > 0.0 { sharpe * return_pct } else { -return_pct.abs() };
    *scores.entry(key.to_string()).or_insert(0.0) += delta;
}

// ---------------------------------------------------------------------------
// Genetic synthesis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genome {
    pub strategy_type: StrategyType,
    pub numeric_genes: HashMap<String, f64>,
    pub symbols: Vec<String>,
    pub regime_preferences: Vec<Regime>,
}

/// Crossover: per-gene average for numerics, random choice for the
/// categorical `strategy_type`, union-and-trim for symbols/regimes.
pub fn crossover(a: &Genome, b: &Genome, rng: &mut impl Rng) -> Genome {
    let mut numeric_genes = HashMap::new();
    for (key, va) in &a.numeric_genes {
        let vb = b.numeric_genes.get(key).copied().unwrap_or(*va);
        numeric_genes.insert(key.clone(), (va + vb) / 2.0);
    }
    let strategy_type = if rng.gen_bool(0.5) { a.strategy_type } else { b.strategy_type };

    let mut symbols: Vec<String> = a.symbols.iter().chain(b.symbols.iter()).cloned().collect();
    symbols.sort();
    symbols.dedup();
    symbols.truncate(a.symbols.len().max(b.symbols.len()).max(1));

    let mut regime_preferences: Vec<Regime> = a.regime_preferences.iter().chain(b.regime_preferences.iter()).copied().collect();
    regime_preferences.sort_by_key(|r| format!("{r:?}"));
    regime_preferences.dedup();

    Genome { strategy_type, numeric_genes, symbols, regime_preferences }
}

/// Mutation rate ~0.15 per gene: numerics get bounded jitter, the
/// categorical `strategy_type` occasionally flips to a neighboring family.
pub fn mutate(genome: &mut Genome, rng: &mut impl Rng) {
    const MUTATION_RATE: f64 = 0.15;
    for value in genome.numeric_genes.values_mut() {
        if rng.gen_bool(MUTATION_RATE) {
            let jitter = rng.gen_range(-0.1..0.1);
            *value *= 1.0 + jitter;
        }
    }
    if rng.gen_bool(MUTATION_RATE) {
        let idx = rng.gen_range(0..crate::types::ALL_STRATEGY_TYPES.len());
        genome.strategy_type = crate::types::ALL_STRATEGY_TYPES[idx];
    }
    if rng.gen_bool(MUTATION_RATE) {
        let idx = rng.gen_range(0..ALL_REGIMES.len());
        let candidate = ALL_REGIMES[idx];
        if !genome.regime_preferences.contains(&candidate) {
            genome.regime_preferences.push(candidate);
        }
    }
}

/// Deterministic, seedable RNG for reproducible genetic synthesis runs.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Produces `offspring_count` candidate genomes from the top-performing
/// parent genomes, via crossover of randomly paired parents followed by
/// mutation.
pub fn synthesize_offspring(parents: &[Genome], offspring_count: usize, seed: u64) -> Vec<Genome> {
    if parents.len() < 2 {
        return parents.to_vec();
    }
    let mut rng = seeded_rng(seed);
    (0..offspring_count)
        .map(|_| {
            let a = &parents[rng.gen_range(0..parents.len())];
            let b = &parents[rng.gen_range(0..parents.len())];
            let mut child = crossover(a, b, &mut rng);
            mutate(&mut child, &mut rng);
            child
        })
        .collect()
}

// ---------------------------------------------------------------------------
// A/B testing (chi-square significance)
// ---------------------------------------------------------------------------

pub mod ab_testing {
    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct WinLossRecord {
        pub wins: u32,
        pub losses: u32,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct AbTestResult {
        pub chi_square: f64,
        pub p_value: f64,
        pub is_significant: bool,
        pub control_win_rate: f64,
        pub treatment_win_rate: f64,
        pub treatment_wins: bool,
    }

    /// Pearson's chi-square test of independence on a 2x2 contingency table
    /// (control wins/losses vs. treatment wins/losses), 1 degree of freedom.
    pub fn chi_square_test(control: WinLossRecord, treatment: WinLossRecord, confidence: f64) -> AbTestResult {
        let total = (control.wins + control.losses + treatment.wins + treatment.losses) as f64;
        let row_control = (control.wins + control.losses) as f64;
        let row_treatment = (treatment.wins + treatment.losses) as f64;
        let col_wins = (control.wins + treatment.wins) as f64;
        let col_losses = (control.losses + treatment.losses) as f64;

        let expected = |row: f64, col: f64| if total > 0.0 { row * col / total } else { 0.0 };
        let cells = [
            (control.wins as f64, expected(row_control, col_wins)),
            (control.losses as f64, expected(row_control, col_losses)),
            (treatment.wins as f64, expected(row_treatment, col_wins)),
            (treatment.losses as f64, expected(row_treatment, col_losses)),
        ];

        let chi_square = cells
            .iter()
            .filter(|(_, e)| *e > 0.0)
            .map(|(o, e)| (o - e).powi(2) / e)
            .sum::<f64>();

        let p_value = if chi_square.is_finite() && chi_square > 0.0 {
            let dist = ChiSquared::new(1.0).expect("df=1 is always valid");
            1.0 - dist.cdf(chi_square)
        } else {
            1.0
        };

        let alpha = 1.0 - confidence;
        let is_significant = p_value < alpha;

        let control_win_rate = if row_control > 0.0 { control.wins as f64 / row_control } else { 0.0 };
        let treatment_win_rate = if row_treatment > 0.0 { treatment.wins as f64 / row_treatment } else { 0.0 };

        AbTestResult {
            chi_square,
            p_value,
            is_significant,
            control_win_rate,
            treatment_win_rate,
            treatment_wins: is_significant && treatment_win_rate > control_win_rate,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(regime: Regime, vol: f64) -> MarketConditions {
        MarketConditions {
            timestamp: Utc::now(),
            regime,
            volatility: vol,
            trend_strength: 0.5,
            volume_trend: 0.5,
            sentiment_score: 0.1,
            fear_greed_index: 50.0,
            btc_correlation: 0.6,
            liquidity: 0.7,
            macro_score: 0.0,
        }
    }

    fn trade(strategy_id: &str, regime: Regime, vol: f64, return_pct: f64) -> HistoricalTrade {
        HistoricalTrade { strategy_id: strategy_id.to_string(), conditions: conditions(regime, vol), return_pct, timestamp: Utc::now() }
    }

    #[test]
    fn knn_returns_closest_neighbors_by_volatility() {
        let history = vec![
            trade("s1", Regime::BullTrending, 0.01, 1.0),
            trade("s1", Regime::BullTrending, 0.02, 1.5),
            trade("s1", Regime::BullTrending, 0.5, -2.0),
        ];
        let current = conditions(Regime::BullTrending, 0.015);
        let (neighbors, similarity) = k_nearest_neighbors(&current, &history, 2);
        assert_eq!(neighbors.len(), 2);
        assert!(similarity > 0.0);
    }

    #[test]
    fn consistency_penalizes_high_variance_winners() {
        let steady: Vec<HistoricalTrade> = (0..10).map(|_| trade("s1", Regime::BullTrending, 0.01, 2.0)).collect();
        let erratic = vec![
            trade("s1", Regime::BullTrending, 0.01, 20.0),
            trade("s1", Regime::BullTrending, 0.01, -18.0),
            trade("s1", Regime::BullTrending, 0.01, 15.0),
        ];
        let steady_refs: Vec<&HistoricalTrade> = steady.iter().collect();
        let erratic_refs: Vec<&HistoricalTrade> = erratic.iter().collect();
        let steady_perf = evaluate_historical_performance(&steady_refs);
        let erratic_perf = evaluate_historical_performance(&erratic_refs);
        assert!(steady_perf.consistency > erratic_perf.consistency);
    }

    #[test]
    fn insufficient_trades_keeps_strategy() {
        let engine = ActivationEngine::new(ActivationThresholds::default());
        let strategy = StrategyRecord {
            id: "s1".to_string(),
            strategy_type: StrategyType::TrendFollowing,
            parameters: HashMap::new(),
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: "1h".to_string(),
            status: StrategyStatus::Kept,
            regime_preferences: vec![Regime::BullTrending],
        };
        let history = vec![trade("s1", Regime::BullTrending, 0.01, 2.0)];
        let decision = engine.evaluate_candidate(&strategy, &conditions(Regime::BullTrending, 0.01), &history, Some((0.6, 1.0)), Some((0.5, 1.0)), 5);
        assert_eq!(decision.status, StrategyStatus::Kept);
    }

    #[test]
    fn concurrency_cap_downgrades_lowest_sharpe() {
        let engine = ActivationEngine::new(ActivationThresholds { max_active_strategies: 1, ..ActivationThresholds::default() });
        let mut decisions = vec![
            ActivationDecision { strategy_id: "a".into(), status: StrategyStatus::Active, expected_sharpe: 2.0, condition_similarity: 0.8, alignment: 0.5, reason: String::new() },
            ActivationDecision { strategy_id: "b".into(), status: StrategyStatus::Active, expected_sharpe: 1.6, condition_similarity: 0.8, alignment: 0.5, reason: String::new() },
        ];
        engine.apply_concurrency_cap(&mut decisions);
        assert_eq!(decisions[0].status, StrategyStatus::Active);
        assert_eq!(decisions[1].status, StrategyStatus::Kept);
    }

    #[test]
    fn crossover_averages_numeric_genes() {
        let mut a_genes = HashMap::new();
        a_genes.insert("sl_pct".to_string(), 0.02);
        let mut b_genes = HashMap::new();
        b_genes.insert("sl_pct".to_string(), 0.04);
        let a = Genome { strategy_type: StrategyType::Momentum, numeric_genes: a_genes, symbols: vec!["BTCUSDT".into()], regime_preferences: vec![Regime::BullTrending] };
        let b = Genome { strategy_type: StrategyType::Swing, numeric_genes: b_genes, symbols: vec!["ETHUSDT".into()], regime_preferences: vec![Regime::SidewaysRange] };
        let mut rng = seeded_rng(42);
        let child = crossover(&a, &b, &mut rng);
        assert!((child.numeric_genes["sl_pct"] - 0.03).abs() < 1e-9);
    }

    #[test]
    fn synthesize_offspring_is_deterministic_for_a_fixed_seed() {
        let mut genes = HashMap::new();
        genes.insert("sl_pct".to_string(), 0.02);
        let parents = vec![
            Genome { strategy_type: StrategyType::Momentum, numeric_genes: genes.clone(), symbols: vec!["BTCUSDT".into()], regime_preferences: vec![] },
            Genome { strategy_type: StrategyType::Swing, numeric_genes: genes, symbols: vec!["ETHUSDT".into()], regime_preferences: vec![] },
        ];
        let a = synthesize_offspring(&parents, 4, 7);
        let b = synthesize_offspring(&parents, 4, 7);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.numeric_genes["sl_pct"], y.numeric_genes["sl_pct"]);
        }
    }

    #[test]
    fn chi_square_detects_significant_improvement() {
        use ab_testing::*;
        let control = WinLossRecord { wins: 60, losses: 40 };
        let treatment = WinLossRecord { wins: 75, losses: 25 };
        let result = chi_square_test(control, treatment, 0.95);
        assert!(result.is_significant);
        assert!(result.treatment_wins);
    }

    #[test]
    fn chi_square_rejects_insignificant_difference() {
        use ab_testing::*;
        let control = WinLossRecord { wins: 50, losses: 50 };
        let treatment = WinLossRecord { wins: 52, losses: 48 };
        let result = chi_square_test(control, treatment, 0.95);
        assert!(!result.is_significant);
    }
}
