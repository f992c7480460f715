// =============================================================================
// Market Data (external interface, spec §6) — OHLCV + sentiment reader
// =============================================================================
//
// `market_data::MarketDataService` is the trait boundary the rest of the core
// depends on: OHLCV candles by symbol/interval/limit/range, recent sentiment
// entries, the tracked-symbol universe, and a historical-availability +
// backfill check. Live ingestion (websocket streams, REST backfill) is an
// external collaborator per spec §1 — this module defines the boundary and
// ships two implementations: `InMemoryMarketData`, a deterministic test
// double built on the teacher's `market_data/candle_buffer.rs` ring-buffer
// idiom, and `BinanceMarketData`, a thin reference reader over
// `binance::client::BinanceClient::get_klines` that demonstrates the trait's
// real-world shape without reimplementing the teacher's websocket ingestion
// pipeline.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backtest::{SentimentEntry, SentimentKind};
use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single closed (or in-progress) OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Builds a candle from the fields a REST klines response actually
    /// carries; the taker-buy/quote-volume/trade-count fields (only present
    /// on the websocket kline payload) default to zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64, close_time: i64) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }
}

/// Composite key identifying a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MarketDataService: Send + Sync {
    /// OHLCV candles for `symbol`/`interval`, most recent `limit` candles,
    /// optionally restricted to `[range.0, range.1]` by `open_time`.
    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> CoreResult<Vec<Candle>>;

    /// Sentiment entries of `kind` (or both kinds if `None`) for `symbol`
    /// (ignored for `SentimentKind::Global` entries) within the last
    /// `hours_back` hours.
    async fn recent_sentiment(
        &self,
        symbol: Option<&str>,
        kind: Option<SentimentKind>,
        hours_back: f64,
    ) -> CoreResult<Vec<SentimentEntry>>;

    /// Symbols this reader currently has candle data for.
    fn tracked_symbols(&self) -> Vec<String>;

    /// Whether at least one candle is available for `symbol`/`interval`.
    async fn has_history(&self, symbol: &str, interval: &str) -> bool;

    /// Triggers a backfill of up to `limit` candles for `symbol`/`interval`;
    /// returns the number of candles actually ingested.
    async fn backfill(&self, symbol: &str, interval: &str, limit: usize) -> CoreResult<usize>;
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------

/// Deterministic `MarketDataService`: candles and sentiment are seeded
/// directly by the caller (tests, backtests) rather than streamed in.
/// Ring-buffer storage per `(symbol, interval)` mirrors the teacher's
/// `CandleBuffer`, trimmed to `max_candles` on every insert.
pub struct InMemoryMarketData {
    max_candles: usize,
    candles: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    sentiment: RwLock<Vec<SentimentEntry>>,
}

impl InMemoryMarketData {
    pub fn new(max_candles: usize) -> Self {
        Self {
            max_candles: max_candles.max(1),
            candles: RwLock::new(HashMap::new()),
            sentiment: RwLock::new(Vec::new()),
        }
    }

    pub fn seed_candles(&self, symbol: &str, interval: &str, series: impl IntoIterator<Item = Candle>) {
        let key = CandleKey { symbol: symbol.to_string(), interval: interval.to_string() };
        let mut buffers = self.candles.write();
        let buf = buffers.entry(key).or_insert_with(VecDeque::new);
        for candle in series {
            buf.push_back(candle);
            if buf.len() > self.max_candles {
                buf.pop_front();
            }
        }
    }

    pub fn seed_sentiment(&self, entry: SentimentEntry) {
        self.sentiment.write().push(entry);
    }
}

#[async_trait]
impl MarketDataService for InMemoryMarketData {
    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> CoreResult<Vec<Candle>> {
        let key = CandleKey { symbol: symbol.to_string(), interval: interval.to_string() };
        let buffers = self.candles.read();
        let Some(buf) = buffers.get(&key) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<Candle> = buf
            .iter()
            .copied()
            .filter(|c| match range {
                Some((start, end)) => {
                    let open = DateTime::<Utc>::from_timestamp_millis(c.open_time).unwrap_or_else(Utc::now);
                    open >= start && open <= end
                }
                None => true,
            })
            .collect();
        if out.len() > limit {
            out = out.split_off(out.len() - limit);
        }
        Ok(out)
    }

    async fn recent_sentiment(
        &self,
        symbol: Option<&str>,
        kind: Option<SentimentKind>,
        hours_back: f64,
    ) -> CoreResult<Vec<SentimentEntry>> {
        let cutoff = Utc::now() - chrono::Duration::seconds((hours_back * 3600.0) as i64);
        let entries = self.sentiment.read();
        Ok(entries
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .filter(|e| kind.map(|k| k == e.kind).unwrap_or(true))
            .filter(|e| match (symbol, &e.symbol) {
                (Some(_), None) => e.kind == SentimentKind::Global,
                (Some(s), Some(es)) => es == s,
                (None, _) => true,
            })
            .cloned()
            .collect())
    }

    fn tracked_symbols(&self) -> Vec<String> {
        self.candles.read().keys().map(|k| k.symbol.clone()).collect()
    }

    async fn has_history(&self, symbol: &str, interval: &str) -> bool {
        let key = CandleKey { symbol: symbol.to_string(), interval: interval.to_string() };
        self.candles.read().get(&key).map(|b| !b.is_empty()).unwrap_or(false)
    }

    async fn backfill(&self, _symbol: &str, _interval: &str, _limit: usize) -> CoreResult<usize> {
        // Nothing to fetch: this implementation only ever serves what was
        // seeded directly. Real backfill is `BinanceMarketData`'s job.
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Binance reference reader
// ---------------------------------------------------------------------------

/// Thin REST-backed `MarketDataService` over `BinanceClient::get_klines`.
/// Demonstrates the trait's real-world shape; sentiment has no Binance REST
/// counterpart so `recent_sentiment` always returns empty, and `backfill`
/// simply re-fetches and caches the latest `limit` candles.
pub struct BinanceMarketData {
    client: Arc<crate::binance::BinanceClient>,
    cache: RwLock<HashMap<CandleKey, Vec<Candle>>>,
}

impl BinanceMarketData {
    pub fn new(client: Arc<crate::binance::BinanceClient>) -> Self {
        Self { client, cache: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl MarketDataService for BinanceMarketData {
    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        _range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> CoreResult<Vec<Candle>> {
        if let Some(cached) = self.cache.read().get(&CandleKey { symbol: symbol.to_string(), interval: interval.to_string() }) {
            if cached.len() >= limit {
                return Ok(cached[cached.len() - limit..].to_vec());
            }
        }
        self.backfill(symbol, interval, limit).await?;
        let cache = self.cache.read();
        Ok(cache
            .get(&CandleKey { symbol: symbol.to_string(), interval: interval.to_string() })
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_sentiment(
        &self,
        _symbol: Option<&str>,
        _kind: Option<SentimentKind>,
        _hours_back: f64,
    ) -> CoreResult<Vec<SentimentEntry>> {
        Ok(Vec::new())
    }

    fn tracked_symbols(&self) -> Vec<String> {
        self.cache.read().keys().map(|k| k.symbol.clone()).collect()
    }

    async fn has_history(&self, symbol: &str, interval: &str) -> bool {
        self.cache
            .read()
            .get(&CandleKey { symbol: symbol.to_string(), interval: interval.to_string() })
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    async fn backfill(&self, symbol: &str, interval: &str, limit: usize) -> CoreResult<usize> {
        let candles = self
            .client
            .get_klines(symbol, interval, limit as u32)
            .await
            .map_err(|e| CoreError::resource_upstream(format!("binance klines fetch failed: {e}")))?;
        let count = candles.len();
        self.cache.write().insert(CandleKey { symbol: symbol.to_string(), interval: interval.to_string() }, candles);
        info!(symbol, interval, count, "binance candle backfill complete");
        Ok(count)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle::new(open_time, close, close * 1.001, close * 0.999, close, 1000.0, open_time + 59_999)
    }

    #[tokio::test]
    async fn in_memory_trims_to_max_candles() {
        let md = InMemoryMarketData::new(3);
        md.seed_candles("BTCUSDT", "1m", (0..5).map(|i| candle(i * 60_000, 100.0 + i as f64)));
        let out = md.candles("BTCUSDT", "1m", 10, None).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].close, 102.0);
    }

    #[tokio::test]
    async fn in_memory_respects_limit() {
        let md = InMemoryMarketData::new(10);
        md.seed_candles("BTCUSDT", "1m", (0..5).map(|i| candle(i * 60_000, 100.0 + i as f64)));
        let out = md.candles("BTCUSDT", "1m", 2, None).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].close, 104.0);
    }

    #[tokio::test]
    async fn recent_sentiment_filters_by_symbol_and_window() {
        let md = InMemoryMarketData::new(10);
        md.seed_sentiment(SentimentEntry {
            symbol: Some("BTCUSDT".to_string()),
            kind: SentimentKind::Symbol,
            score: 0.5,
            timestamp: Utc::now(),
        });
        md.seed_sentiment(SentimentEntry {
            symbol: Some("ETHUSDT".to_string()),
            kind: SentimentKind::Symbol,
            score: -0.2,
            timestamp: Utc::now() - chrono::Duration::hours(100),
        });
        let recent = md.recent_sentiment(Some("BTCUSDT"), None, 24.0).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].symbol.as_deref(), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn has_history_false_for_unseeded_symbol() {
        let md = InMemoryMarketData::new(10);
        assert!(!md.has_history("BTCUSDT", "1m").await);
    }
}
