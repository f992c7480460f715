// =============================================================================
// Shared types used across the core execution / position / rate-limit /
// backtest / activation engines
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Trade direction. Kept as a tagged enum (design note: dynamic dict-typed
/// parameters become tagged variants) rather than the free-form "BUY"/"SELL"
/// strings an earlier iteration of this engine used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// +1.0 for long, -1.0 for short — the sign convention used throughout
    /// PnL and slippage formulas in this crate.
    pub fn sign(self) -> f64 {
        if self.is_long() {
            1.0
        } else {
            -1.0
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown side: {other}"
            ))),
        }
    }
}

/// Strategy family classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Momentum,
    MeanReversion,
    Breakout,
    TrendFollowing,
    Scalping,
    Swing,
    Arbitrage,
    Hybrid,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Momentum => "momentum",
            Self::MeanReversion => "mean_reversion",
            Self::Breakout => "breakout",
            Self::TrendFollowing => "trend_following",
            Self::Scalping => "scalping",
            Self::Swing => "swing",
            Self::Arbitrage => "arbitrage",
            Self::Hybrid => "hybrid",
        };
        write!(f, "{s}")
    }
}

pub const ALL_STRATEGY_TYPES: [StrategyType; 8] = [
    StrategyType::Momentum,
    StrategyType::MeanReversion,
    StrategyType::Breakout,
    StrategyType::TrendFollowing,
    StrategyType::Scalping,
    StrategyType::Swing,
    StrategyType::Arbitrage,
    StrategyType::Hybrid,
];

/// Qualitative market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    BullTrending,
    BearTrending,
    SidewaysRange,
    HighVolatility,
    LowVolatility,
    Crisis,
    Recovery,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BullTrending => "bull_trending",
            Self::BearTrending => "bear_trending",
            Self::SidewaysRange => "sideways_range",
            Self::HighVolatility => "high_volatility",
            Self::LowVolatility => "low_volatility",
            Self::Crisis => "crisis",
            Self::Recovery => "recovery",
        };
        write!(f, "{s}")
    }
}

pub const ALL_REGIMES: [Regime; 7] = [
    Regime::BullTrending,
    Regime::BearTrending,
    Regime::SidewaysRange,
    Regime::HighVolatility,
    Regime::LowVolatility,
    Regime::Crisis,
    Regime::Recovery,
];

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn side_sign_matches_direction() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn side_parses_legacy_strings() {
        assert_eq!(Side::from_str("buy").unwrap(), Side::Long);
        assert_eq!(Side::from_str("SELL").unwrap(), Side::Short);
        assert!(Side::from_str("sideways").is_err());
    }

    #[test]
    fn strategy_type_display_is_snake_case() {
        assert_eq!(StrategyType::MeanReversion.to_string(), "mean_reversion");
        assert_eq!(ALL_STRATEGY_TYPES.len(), 8);
    }

    #[test]
    fn regime_table_has_seven_entries() {
        assert_eq!(ALL_REGIMES.len(), 7);
        assert_eq!(Regime::SidewaysRange.to_string(), "sideways_range");
    }
}
