// =============================================================================
// Cache Manager (C3) — tiered local + distributed result cache
// =============================================================================
//
// Grounded on `examples/original_source/api_rate_limiting/cache_manager.py`
// for the strategy/entry shape. Eviction policy is a tagged enum rather than
// an inheritance chain (design note), each variant implementing its own
// admission/eviction bookkeeping inside `CacheContainer`.
// =============================================================================

use crate::error::{CoreError, CoreResult};
use crate::store::{cache_key, SharedStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Ttl,
    Lru,
    Lfu,
    Fifo,
}

impl std::str::FromStr for CacheStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ttl" => Ok(Self::Ttl),
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            other => Err(CoreError::configuration(format!("unknown cache strategy: {other}"))),
        }
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ttl => "ttl",
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
        };
        write!(f, "{s}")
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: f64,
    pub accessed_at: f64,
    pub access_count: u64,
    pub ttl: Option<f64>,
    pub size_bytes: usize,
    pub compressed: bool,
}

impl CacheEntry {
    fn is_expired(&self, now: f64) -> bool {
        matches!(self.ttl, Some(ttl) if now >= self.created_at + ttl)
    }
}

/// Compresses `value` with gzip when `enable_compression` and its size
/// exceeds `threshold_bytes`; keeps the compressed form only if smaller.
fn maybe_compress(value: &[u8], enable: bool, threshold_bytes: usize) -> (Vec<u8>, bool) {
    if !enable || value.len() <= threshold_bytes {
        return (value.to_vec(), false);
    }
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(value).is_err() {
        return (value.to_vec(), false);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < value.len() => (compressed, true),
        _ => (value.to_vec(), false),
    }
}

fn decompress(value: &[u8]) -> CoreResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    let mut decoder = GzDecoder::new(value);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CoreError::logic(format!("cache decompression failed: {e}")))?;
    Ok(out)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub size: usize,
}

/// Per-strategy local tier: bounded, eviction rule honored strictly.
/// Readers and writers share a per-container mutex.
struct CacheContainer {
    strategy: CacheStrategy,
    max_size: usize,
    entries: std::collections::HashMap<String, CacheEntry>,
    /// LRU/FIFO order: front = oldest/least-recently-used.
    order: VecDeque<String>,
    /// LFU frequency, ties broken by insertion order already captured by
    /// `order`.
    freq: std::collections::HashMap<String, u64>,
}

impl CacheContainer {
    fn new(strategy: CacheStrategy, max_size: usize) -> Self {
        Self {
            strategy,
            max_size,
            entries: std::collections::HashMap::new(),
            order: VecDeque::new(),
            freq: std::collections::HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn touch_order_to_back(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let now = now_secs();
        let expired = self.entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false);
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.accessed_at = now;
        entry.access_count += 1;
        let cloned = entry.clone();
        match self.strategy {
            CacheStrategy::Lru => self.touch_order_to_back(key),
            CacheStrategy::Lfu => {
                *self.freq.entry(key.to_string()).or_insert(0) += 1;
            }
            CacheStrategy::Ttl | CacheStrategy::Fifo => {}
        }
        Some(cloned)
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.freq.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key)
    }

    fn evict_one(&mut self) -> Option<String> {
        let victim = match self.strategy {
            CacheStrategy::Lru | CacheStrategy::Fifo => self.order.front().cloned(),
            CacheStrategy::Lfu => self
                .order
                .iter()
                .min_by_key(|k| self.freq.get(*k).copied().unwrap_or(0))
                .cloned(),
            CacheStrategy::Ttl => {
                // Lazy eviction already strips expired entries on read; when
                // forced to evict under capacity pressure, fall back to
                // oldest-created (closest to its own TTL deadline).
                self.entries
                    .values()
                    .min_by(|a, b| a.created_at.partial_cmp(&b.created_at).unwrap())
                    .map(|e| e.key.clone())
            }
        };
        if let Some(ref key) = victim {
            self.remove(key);
        }
        victim
    }

    fn set(&mut self, entry: CacheEntry) -> u64 {
        let mut evictions = 0;
        let key = entry.key.clone();
        let existed = self.entries.contains_key(&key);
        self.entries.insert(key.clone(), entry);
        if !existed {
            self.order.push_back(key.clone());
            self.freq.insert(key.clone(), 0);
        } else {
            self.touch_order_to_back(&key);
        }
        while self.entries.len() > self.max_size {
            if self.evict_one().is_some() {
                evictions += 1;
            } else {
                break;
            }
        }
        evictions
    }

    fn sweep_expired(&mut self) -> u64 {
        let now = now_secs();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let n = expired.len() as u64;
        for k in expired {
            self.remove(&k);
        }
        n
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.freq.clear();
    }
}

pub struct CacheManagerConfig {
    pub max_size_per_strategy: usize,
    pub enable_compression: bool,
    pub compression_threshold_bytes: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            max_size_per_strategy: 10_000,
            enable_compression: true,
            compression_threshold_bytes: 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub struct CacheManager {
    store: Arc<dyn SharedStore>,
    containers: dashmap::DashMap<CacheStrategy, parking_lot::Mutex<CacheContainer>>,
    config: CacheManagerConfig,
    stats: dashmap::DashMap<CacheStrategy, CacheStatistics>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn SharedStore>, config: CacheManagerConfig) -> Self {
        Self {
            store,
            containers: dashmap::DashMap::new(),
            config,
            stats: dashmap::DashMap::new(),
        }
    }

    fn container(&self, strategy: CacheStrategy) -> dashmap::mapref::one::Ref<'_, CacheStrategy, parking_lot::Mutex<CacheContainer>> {
        self.containers
            .entry(strategy)
            .or_insert_with(|| parking_lot::Mutex::new(CacheContainer::new(strategy, self.config.max_size_per_strategy)));
        self.containers.get(&strategy).unwrap()
    }

    fn record(&self, strategy: CacheStrategy, f: impl FnOnce(&mut CacheStatistics)) {
        let mut entry = self.stats.entry(strategy).or_insert_with(CacheStatistics::default);
        f(&mut entry);
    }

    /// `get(key, strategy, use_distributed)` — local tier
    /// first, distributed tier on miss, promoted into local on hit.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        strategy: CacheStrategy,
        use_distributed: bool,
    ) -> CoreResult<Option<T>> {
        {
            let container = self.container(strategy);
            let mut guard = container.lock();
            if let Some(entry) = guard.get(key) {
                drop(guard);
                self.record(strategy, |s| s.hits += 1);
                let bytes = if entry.compressed { decompress(&entry.value)? } else { entry.value };
                let value: T = serde_json::from_slice(&bytes)
                    .map_err(|e| CoreError::logic(format!("cache entry corrupt: {e}")))?;
                return Ok(Some(value));
            }
        }

        if !use_distributed {
            self.record(strategy, |s| s.misses += 1);
            return Ok(None);
        }

        let dist_key = cache_key(&strategy.to_string(), key);
        let raw = match self.store.get_raw(&dist_key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "distributed cache read failed, degrading to miss");
                self.record(strategy, |s| s.misses += 1);
                return Ok(None);
            }
        };
        let Some(bytes) = raw else {
            self.record(strategy, |s| s.misses += 1);
            return Ok(None);
        };

        let record: DistributedRecord = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::logic(format!("distributed cache record corrupt: {e}")))?;
        let payload = if record.compressed { decompress(&record.value_bytes)? } else { record.value_bytes };
        let value: T = serde_json::from_slice(&payload)
            .map_err(|e| CoreError::logic(format!("cache payload corrupt: {e}")))?;

        // Promote into local tier.
        let now = now_secs();
        let entry = CacheEntry {
            key: key.to_string(),
            value: payload.clone(),
            created_at: record.created_at,
            accessed_at: now,
            access_count: 1,
            ttl: record.ttl,
            size_bytes: payload.len(),
            compressed: false,
        };
        {
            let container = self.container(strategy);
            container.lock().set(entry);
        }
        self.record(strategy, |s| s.hits += 1);
        Ok(Some(value))
    }

    /// `set(key, value, strategy, ttl?, use_distributed)`.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        strategy: CacheStrategy,
        ttl: Option<Duration>,
        use_distributed: bool,
    ) -> CoreResult<()> {
        let serialized =
            serde_json::to_vec(value).map_err(|e| CoreError::validation(format!("cache value not serializable: {e}")))?;
        let (bytes, compressed) =
            maybe_compress(&serialized, self.config.enable_compression, self.config.compression_threshold_bytes);

        let now = now_secs();
        let entry = CacheEntry {
            key: key.to_string(),
            value: bytes.clone(),
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl: ttl.map(|d| d.as_secs_f64()),
            size_bytes: bytes.len(),
            compressed,
        };

        let evictions = {
            let container = self.container(strategy);
            container.lock().set(entry)
        };
        self.record(strategy, |s| {
            s.sets += 1;
            s.evictions += evictions;
        });

        if use_distributed {
            let dist_key = cache_key(&strategy.to_string(), key);
            let record = DistributedRecord {
                value_bytes: bytes,
                compressed,
                created_at: now,
                strategy: strategy.to_string(),
                ttl: ttl.map(|d| d.as_secs_f64()),
            };
            let payload = serde_json::to_vec(&record).map_err(|e| CoreError::logic(e.to_string()))?;
            if let Err(e) = self.store.set_raw(&dist_key, payload, ttl).await {
                tracing::warn!(error = %e, "distributed cache write failed");
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str, strategy: CacheStrategy, use_distributed: bool) -> CoreResult<()> {
        {
            let container = self.container(strategy);
            container.lock().remove(key);
        }
        if use_distributed {
            let dist_key = cache_key(&strategy.to_string(), key);
            self.store.delete(&dist_key).await?;
        }
        Ok(())
    }

    pub fn clear(&self, strategy: Option<CacheStrategy>) {
        match strategy {
            Some(s) => {
                self.container(s).lock().clear();
            }
            None => {
                for entry in self.containers.iter() {
                    entry.value().lock().clear();
                }
            }
        }
    }

    pub fn statistics(&self, strategy: CacheStrategy) -> CacheStatistics {
        let mut stats = self.stats.entry(strategy).or_insert_with(CacheStatistics::default).clone();
        stats.size = self.container(strategy).lock().len();
        stats
    }

    /// `health()` — whether every container honors its bound right now.
    pub fn health(&self) -> bool {
        self.containers
            .iter()
            .all(|e| e.value().lock().len() <= self.config.max_size_per_strategy)
    }

    /// Periodic TTL sweep, at least once a minute, on top of lazy eviction
    /// on read. Follows the `tokio::time::interval` background-task idiom
    /// used by this crate's other monitor loops.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            let mut total = 0u64;
            for entry in self.containers.iter() {
                total += entry.value().lock().sweep_expired();
            }
            if total > 0 {
                tracing::debug!(swept = total, "cache TTL sweep");
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DistributedRecord {
    value_bytes: Vec<u8>,
    compressed: bool,
    created_at: f64,
    strategy: String,
    ttl: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use proptest::prelude::*;

    fn manager() -> CacheManager {
        CacheManager::new(Arc::new(InMemoryStore::new()), CacheManagerConfig::default())
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let m = manager();
        m.set("k", &"hello".to_string(), CacheStrategy::Ttl, None, true).await.unwrap();
        let v: Option<String> = m.get("k", CacheStrategy::Ttl, true).await.unwrap();
        assert_eq!(v, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn set_then_delete_is_a_miss() {
        let m = manager();
        m.set("k", &42i32, CacheStrategy::Lru, None, false).await.unwrap();
        m.delete("k", CacheStrategy::Lru, false).await.unwrap();
        let v: Option<i32> = m.get("k", CacheStrategy::Lru, false).await.unwrap();
        assert_eq!(v, None);
    }

    #[tokio::test]
    async fn ttl_expiry_hides_entry() {
        let m = manager();
        m.set("k", &1i32, CacheStrategy::Ttl, Some(Duration::from_millis(1)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let v: Option<i32> = m.get("k", CacheStrategy::Ttl, false).await.unwrap();
        assert_eq!(v, None);
    }

    #[tokio::test]
    async fn lru_container_never_exceeds_max_size() {
        let m = CacheManager::new(
            Arc::new(InMemoryStore::new()),
            CacheManagerConfig { max_size_per_strategy: 3, ..Default::default() },
        );
        for i in 0..10 {
            m.set(&format!("k{i}"), &i, CacheStrategy::Lru, None, false).await.unwrap();
        }
        assert!(m.statistics(CacheStrategy::Lru).size <= 3);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let m = CacheManager::new(
            Arc::new(InMemoryStore::new()),
            CacheManagerConfig { max_size_per_strategy: 2, ..Default::default() },
        );
        m.set("a", &1, CacheStrategy::Lru, None, false).await.unwrap();
        m.set("b", &2, CacheStrategy::Lru, None, false).await.unwrap();
        let _: Option<i32> = m.get("a", CacheStrategy::Lru, false).await.unwrap();
        m.set("c", &3, CacheStrategy::Lru, None, false).await.unwrap();
        let b: Option<i32> = m.get("b", CacheStrategy::Lru, false).await.unwrap();
        assert_eq!(b, None);
        let a: Option<i32> = m.get("a", CacheStrategy::Lru, false).await.unwrap();
        assert_eq!(a, Some(1));
    }

    #[test]
    fn compression_roundtrips_for_arbitrary_value() {
        let value = vec![b'x'; 4096];
        let (compressed, was_compressed) = maybe_compress(&value, true, 64);
        assert!(was_compressed);
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn unknown_strategy_string_is_configuration_error() {
        use std::str::FromStr;
        let err = CacheStrategy::from_str("mru").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Configuration);
    }

    proptest! {
        /// spec §8: "decompress(compress(v)) = v for arbitrary value v."
        #[test]
        fn compression_roundtrips_for_any_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let (stored, was_compressed) = maybe_compress(&bytes, true, 16);
            let restored = if was_compressed { decompress(&stored).unwrap() } else { stored };
            prop_assert_eq!(restored, bytes);
        }

        /// spec §8: "∀ cache container c, size(c) <= c.max_size after every
        /// mutation; no evicted key is returned by a subsequent get."
        #[test]
        fn container_never_exceeds_max_size_under_random_sets(
            max_size in 1usize..8,
            keys in proptest::collection::vec(0u32..20, 1..40),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let m = CacheManager::new(
                Arc::new(InMemoryStore::new()),
                CacheManagerConfig { max_size_per_strategy: max_size, ..Default::default() },
            );
            rt.block_on(async {
                for k in &keys {
                    m.set(&format!("k{k}"), k, CacheStrategy::Lfu, None, false).await.unwrap();
                    prop_assert!(m.statistics(CacheStrategy::Lfu).size <= max_size);
                }
                Ok(())
            })?;
        }
    }
}
