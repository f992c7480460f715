// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the trading core. Every tunable named across
// C1-C5 (execution algorithm defaults, rate-limit/cache sizing, activation
// thresholds, GA parameters) lives here so the engine can be reconfigured
// without a restart.
//
// Persistence uses the same atomic tmp + rename pattern as
// `persistence::atomic_write`; every field carries `#[serde(default)]` so
// that adding new fields never breaks loading an older config file. Fields
// that parse into a constrained type (`RuleAlgorithm`, `CacheStrategy`,
// `ExecutionAlgorithm`) are validated eagerly at load time via `validate()`
// and reject with `CoreError::configuration` rather than silently falling
// back to a default — per spec §7, unknown algorithm names are a
// Configuration-kind error, not a tolerated default substitution.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ratelimit::RuleAlgorithm;
use crate::types::{AccountMode, TradingMode};

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "BNBUSDT".to_string(), "SOLUSDT".to_string()]
}

fn default_rate_limit_algorithm() -> String {
    "token_bucket".to_string()
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst_size() -> u32 {
    20
}

fn default_cache_max_size_per_strategy() -> usize {
    10_000
}

fn default_compression_threshold_bytes() -> usize {
    1024
}

fn default_cache_sweep_interval_secs() -> u64 {
    60
}

fn default_min_historical_trades() -> usize {
    20
}

fn default_min_condition_similarity() -> f64 {
    0.7
}

fn default_min_alignment() -> f64 {
    0.45
}

fn default_min_expected_sharpe() -> f64 {
    1.0
}

fn default_strong_expected_sharpe() -> f64 {
    1.5
}

fn default_max_active_strategies() -> usize {
    5
}

fn default_mutation_rate() -> f64 {
    0.15
}

fn default_activation_cycle_secs() -> u64 {
    300
}

fn default_drain_window_secs() -> u64 {
    30
}

/// Rate-limit / cache tunables that back the default rule set the engine
/// installs on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    #[serde(default = "default_rate_limit_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            algorithm: default_rate_limit_algorithm(),
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

impl RateLimitDefaults {
    fn validate(&self) -> CoreResult<()> {
        self.algorithm
            .parse::<RuleAlgorithm>()
            .map(|_| ())
            .map_err(|e| CoreError::configuration(format!("rate_limit.algorithm: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefaults {
    #[serde(default = "default_cache_max_size_per_strategy")]
    pub max_size_per_strategy: usize,
    #[serde(default = "default_true")]
    pub enable_compression: bool,
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            max_size_per_strategy: default_cache_max_size_per_strategy(),
            enable_compression: true,
            compression_threshold_bytes: default_compression_threshold_bytes(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

/// Mirrors `activation::ActivationThresholds`, kept as a separate
/// JSON-serializable config type so the engine can tune activation without
/// recompiling; `app::Core` converts this into the real type at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationTuning {
    #[serde(default = "default_min_historical_trades")]
    pub min_historical_trades: usize,
    #[serde(default = "default_min_condition_similarity")]
    pub min_condition_similarity: f64,
    #[serde(default = "default_min_alignment")]
    pub min_alignment: f64,
    #[serde(default = "default_min_expected_sharpe")]
    pub min_expected_sharpe: f64,
    #[serde(default = "default_strong_expected_sharpe")]
    pub strong_expected_sharpe: f64,
    #[serde(default = "default_max_active_strategies")]
    pub max_active_strategies: usize,
    #[serde(default = "default_activation_cycle_secs")]
    pub cycle_interval_secs: u64,
}

impl Default for ActivationTuning {
    fn default() -> Self {
        Self {
            min_historical_trades: default_min_historical_trades(),
            min_condition_similarity: default_min_condition_similarity(),
            min_alignment: default_min_alignment(),
            min_expected_sharpe: default_min_expected_sharpe(),
            strong_expected_sharpe: default_strong_expected_sharpe(),
            max_active_strategies: default_max_active_strategies(),
            cycle_interval_secs: default_activation_cycle_secs(),
        }
    }
}

/// Genetic-algorithm learning-loop tunables consumed by
/// `activation::{Genome::mutate, synthesize_offspring}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaTuning {
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
}

impl Default for GaTuning {
    fn default() -> Self {
        Self { mutation_rate: default_mutation_rate() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub rate_limit: RateLimitDefaults,
    #[serde(default)]
    pub cache: CacheDefaults,
    #[serde(default)]
    pub activation: ActivationTuning,
    #[serde(default)]
    pub ga: GaTuning,

    /// Graceful-shutdown drain window (spec §6): flush open positions,
    /// cancel pending slices, persist activation state within this budget.
    #[serde(default = "default_drain_window_secs")]
    pub shutdown_drain_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            rate_limit: RateLimitDefaults::default(),
            cache: CacheDefaults::default(),
            activation: ActivationTuning::default(),
            ga: GaTuning::default(),
            shutdown_drain_secs: default_drain_window_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Loads and validates configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        config.validate().context("runtime config failed validation")?;
        info!(path = %path.display(), symbols = ?config.symbols, trading_mode = %config.trading_mode, "runtime config loaded");
        Ok(config)
    }

    /// Validates algorithm-name fields eagerly; see module docs.
    pub fn validate(&self) -> CoreResult<()> {
        self.rate_limit.validate()
    }

    /// Persists the current configuration to `path` using an atomic write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.activation.max_active_strategies, 5);
        assert!((cfg.ga.mutation_rate - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.rate_limit.algorithm, "token_bucket");
        assert_eq!(cfg.shutdown_drain_secs, 30);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.cache.max_size_per_strategy, 10_000);
    }

    #[test]
    fn validate_rejects_unknown_rate_limit_algorithm() {
        let mut cfg = RuntimeConfig::default();
        cfg.rate_limit.algorithm = "not_a_real_algorithm".to_string();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }
}
