// =============================================================================
// Shared state store — external interface
// =============================================================================
//
// Backs the rate limiter and the distributed cache tier with a single trait
// so both can run against an in-process dashmap for tests/single-replica
// deployments, or against Redis for a multi-replica deployment, without
// changing a line of C3 logic.
// =============================================================================

use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Namespaced key helpers: `rate_limit:<algo>:<hash>`, `cache:<strategy>:<hash>`.
pub fn rate_limit_key(algo: &str, identifier_hash: &str) -> String {
    format!("rate_limit:{algo}:{identifier_hash}")
}

pub fn cache_key(strategy: &str, key_hash: &str) -> String {
    format!("cache:{strategy}:{key_hash}")
}

/// A scripted atomic read-modify-write. The store guarantees `f` observes and
/// replaces the value for `key` without another caller's update interleaving.
pub type AtomicUpdate<'a> = dyn FnMut(Option<&[u8]>) -> Option<Vec<u8>> + Send + 'a;

/// Collaborator trait for shared, cross-replica state.
///
/// All operations are async because a real backing store (Redis) suspends on
/// network I/O.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments `key` by 1, setting (or refreshing) its
    /// expiry to `ttl` on first creation, and returns the new value.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CoreResult<i64>;

    /// Adds `member` with `score` to the sorted set at `key`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()>;

    /// Returns members with `min ≤ score ≤ max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<Vec<(String, f64)>>;

    /// Removes members with `min ≤ score ≤ max`; returns the count removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64>;

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<Vec<u8>>>;

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> CoreResult<()>;

    /// Sets the TTL on an existing key (used by callers who bypass
    /// `incr_with_expiry`, e.g. after a `hset`).
    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;

    /// Executes `f` as an atomic compare-and-swap: reads the current bytes,
    /// lets `f` decide the replacement (`None` deletes), writes it back
    /// without another writer observing an intermediate state.
    async fn eval_atomic(&self, key: &str, f: &mut AtomicUpdate<'_>) -> CoreResult<Option<Vec<u8>>>;

    async fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()>;

    async fn delete(&self, key: &str) -> CoreResult<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<i64>,
}

struct SortedSet {
    members: Vec<(String, f64)>,
    expires_at_ms: Option<i64>,
}

struct HashTable {
    fields: DashMap<String, Vec<u8>>,
    expires_at_ms: Option<i64>,
}

/// `dashmap`-backed store: per-key atomicity comes from the shard lock each
/// `DashMap` entry access already takes, with no global or reentrant lock
/// anywhere in the store.
pub struct InMemoryStore {
    counters: DashMap<String, AtomicI64>,
    counter_expiry: DashMap<String, AtomicI64>,
    sorted_sets: DashMap<String, parking_lot::Mutex<SortedSet>>,
    hashes: DashMap<String, HashTable>,
    values: DashMap<String, parking_lot::Mutex<Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            counter_expiry: DashMap::new(),
            sorted_sets: DashMap::new(),
            hashes: DashMap::new(),
            values: DashMap::new(),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn is_expired(expires_at_ms: Option<i64>, now: i64) -> bool {
        matches!(expires_at_ms, Some(exp) if now >= exp)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SharedStore for InMemoryStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CoreResult<i64> {
        let now = Self::now_ms();
        let expired = self
            .counter_expiry
            .get(key)
            .map(|e| Self::is_expired(Some(e.load(Ordering::Relaxed)), now))
            .unwrap_or(false);
        if expired {
            self.counters.remove(key);
        }
        let counter = self.counters.entry(key.to_string()).or_insert_with(|| AtomicI64::new(0));
        let new_val = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if new_val == 1 {
            self.counter_expiry
                .insert(key.to_string(), AtomicI64::new(now + ttl.as_millis() as i64));
        }
        Ok(new_val)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
        let mut set = self
            .sorted_sets
            .entry(key.to_string())
            .or_insert_with(|| parking_lot::Mutex::new(SortedSet { members: Vec::new(), expires_at_ms: None }));
        let mut guard = set.lock();
        if let Some(existing) = guard.members.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
        } else {
            guard.members.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<Vec<(String, f64)>> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let guard = set.lock();
        let mut out: Vec<(String, f64)> = guard
            .members
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Ok(0);
        };
        let mut guard = set.lock();
        let before = guard.members.len();
        guard.members.retain(|(_, score)| !(*score >= min && *score <= max));
        Ok((before - guard.members.len()) as u64)
    }

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<Vec<u8>>> {
        let now = Self::now_ms();
        let Some(table) = self.hashes.get(key) else {
            return Ok(None);
        };
        if Self::is_expired(table.expires_at_ms, now) {
            drop(table);
            self.hashes.remove(key);
            return Ok(None);
        }
        Ok(table.fields.get(field).map(|v| v.clone()))
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> CoreResult<()> {
        let table = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| HashTable { fields: DashMap::new(), expires_at_ms: None });
        table.fields.insert(field.to_string(), value);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let now = Self::now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        if let Some(mut table) = self.hashes.get_mut(key) {
            table.expires_at_ms = Some(expires_at);
        }
        if let Some(set) = self.sorted_sets.get(key) {
            set.lock().expires_at_ms = Some(expires_at);
        }
        if let Some(entry) = self.values.get(key) {
            entry.lock().expires_at_ms = Some(expires_at);
        }
        Ok(())
    }

    async fn eval_atomic(&self, key: &str, f: &mut AtomicUpdate<'_>) -> CoreResult<Option<Vec<u8>>> {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| parking_lot::Mutex::new(Entry { value: Vec::new(), expires_at_ms: None }));
        let mut guard = entry.lock();
        let now = Self::now_ms();
        let current = if Self::is_expired(guard.expires_at_ms, now) {
            None
        } else {
            Some(guard.value.as_slice())
        };
        let replacement = f(current);
        match replacement {
            Some(bytes) => {
                guard.value = bytes.clone();
                Ok(Some(bytes))
            }
            None => {
                guard.value.clear();
                Ok(None)
            }
        }
    }

    async fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let now = Self::now_ms();
        let Some(entry) = self.values.get(key) else {
            return Ok(None);
        };
        let guard = entry.lock();
        if Self::is_expired(guard.expires_at_ms, now) {
            drop(guard);
            self.values.remove(key);
            return Ok(None);
        }
        Ok(Some(guard.value.clone()))
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()> {
        let expires_at_ms = ttl.map(|d| Self::now_ms() + d.as_millis() as i64);
        self.values
            .insert(key.to_string(), parking_lot::Mutex::new(Entry { value, expires_at_ms }));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.values.remove(key);
        self.hashes.remove(key);
        self.sorted_sets.remove(key);
        self.counters.remove(key);
        self.counter_expiry.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis_store {
    use super::*;
    use redis::AsyncCommands;

    /// Thin wrapper over the `redis` crate (tokio-comp), feature-gated so the
    /// default build needs no running Redis. Uses `INCR`+`EXPIRE`,
    /// `ZADD`/`ZRANGEBYSCORE`/`ZREMRANGEBYSCORE`, `HSET`/`HGET`, and an
    /// `EVAL` Lua script for the compare-and-set `eval_atomic` primitive the
    /// token-bucket/leaky-bucket algorithms need.
    pub struct RedisStore {
        manager: redis::aio::ConnectionManager,
    }

    impl RedisStore {
        pub async fn connect(url: &str) -> CoreResult<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| CoreError::resource_upstream(format!("redis client: {e}")))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis connect: {e}")))?;
            Ok(Self { manager })
        }
    }

    /// Max optimistic-retry attempts for `eval_atomic` before giving up on a
    /// hot key under heavy contention.
    const CAS_MAX_RETRIES: u32 = 20;

    #[async_trait::async_trait]
    impl SharedStore for RedisStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CoreResult<i64> {
            let mut conn = self.manager.clone();
            let val: i64 = conn
                .incr(key, 1)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis incr: {e}")))?;
            if val == 1 {
                let _: () = conn
                    .expire(key, ttl.as_secs() as i64)
                    .await
                    .map_err(|e| CoreError::resource_upstream(format!("redis expire: {e}")))?;
            }
            Ok(val)
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            let _: () = conn
                .zadd(key, member, score)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis zadd: {e}")))?;
            Ok(())
        }

        async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<Vec<(String, f64)>> {
            let mut conn = self.manager.clone();
            let raw: Vec<(String, f64)> = conn
                .zrangebyscore_withscores(key, min, max)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis zrangebyscore: {e}")))?;
            Ok(raw)
        }

        async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
            let mut conn = self.manager.clone();
            let removed: u64 = conn
                .zrembyscore(key, min, max)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis zremrangebyscore: {e}")))?;
            Ok(removed)
        }

        async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<Vec<u8>>> {
            let mut conn = self.manager.clone();
            let val: Option<Vec<u8>> = conn
                .hget(key, field)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis hget: {e}")))?;
            Ok(val)
        }

        async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            let _: () = conn
                .hset(key, field, value)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis hset: {e}")))?;
            Ok(())
        }

        async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            let _: () = conn
                .expire(key, ttl.as_secs() as i64)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis expire: {e}")))?;
            Ok(())
        }

        /// Optimistic compare-and-set: `WATCH` the key, read it, let the
        /// caller compute the replacement, then commit via `MULTI`/`EXEC`.
        /// If another client wrote the key between the `WATCH` and the
        /// `EXEC`, the transaction aborts (redis-rs surfaces this as a `nil`
        /// pipeline result) and the whole read/compute/commit cycle retries.
        /// This is the real atomicity primitive the token-bucket/leaky-bucket
        /// algorithms need under concurrent, multi-replica callers.
        async fn eval_atomic(&self, key: &str, f: &mut AtomicUpdate<'_>) -> CoreResult<Option<Vec<u8>>> {
            let mut conn = self.manager.clone();
            for _ in 0..CAS_MAX_RETRIES {
                let _: () = redis::cmd("WATCH")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CoreError::resource_upstream(format!("redis watch: {e}")))?;

                let current: Option<Vec<u8>> = conn
                    .get(key)
                    .await
                    .map_err(|e| CoreError::resource_upstream(format!("redis get: {e}")))?;
                let replacement = f(current.as_deref());

                let mut pipe = redis::pipe();
                pipe.atomic();
                match &replacement {
                    Some(bytes) => {
                        pipe.set(key, bytes.clone());
                    }
                    None => {
                        pipe.del(key);
                    }
                }
                let committed: Option<Vec<redis::Value>> = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CoreError::resource_upstream(format!("redis exec: {e}")))?;

                if committed.is_some() {
                    return Ok(replacement);
                }
                // Transaction aborted (watched key changed concurrently); retry.
            }
            Err(CoreError::resource_upstream(format!("redis cas exhausted retries for {key}")))
        }

        async fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
            let mut conn = self.manager.clone();
            let val: Option<Vec<u8>> = conn
                .get(key)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis get: {e}")))?;
            Ok(val)
        }

        async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            match ttl {
                Some(d) => {
                    let _: () = conn
                        .set_ex(key, value, d.as_secs())
                        .await
                        .map_err(|e| CoreError::resource_upstream(format!("redis setex: {e}")))?;
                }
                None => {
                    let _: () = conn
                        .set(key, value)
                        .await
                        .map_err(|e| CoreError::resource_upstream(format!("redis set: {e}")))?;
                }
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            let _: () = conn
                .del(key)
                .await
                .map_err(|e| CoreError::resource_upstream(format!("redis del: {e}")))?;
            Ok(())
        }
    }
}

#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_with_expiry_counts_up() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr_with_expiry("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("k", Duration::from_secs(60)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zadd_and_range_by_score() {
        let store = InMemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "c", 3.0).await.unwrap();
        let members = store.zrange_by_score("z", 1.5, 3.0).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, "b");
    }

    #[tokio::test]
    async fn zremrangebyscore_removes_matching() {
        let store = InMemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();
        let removed = store.zremrangebyscore("z", 0.0, 1.5).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store.zrange_by_score("z", 0.0, 10.0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "b");
    }

    #[tokio::test]
    async fn hget_hset_roundtrip() {
        let store = InMemoryStore::new();
        store.hset("h", "f", b"value".to_vec()).await.unwrap();
        assert_eq!(store.hget("h", "f").await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.hget("h", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn eval_atomic_applies_replacement() {
        let store = InMemoryStore::new();
        store
            .eval_atomic("cas", &mut |_cur| Some(b"1".to_vec()))
            .await
            .unwrap();
        let result = store
            .eval_atomic("cas", &mut |cur| {
                let n: i64 = cur.map(|b| String::from_utf8_lossy(b).parse().unwrap()).unwrap_or(0);
                Some((n + 1).to_string().into_bytes())
            })
            .await
            .unwrap();
        assert_eq!(result, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn set_raw_respects_ttl_expiry_window() {
        let store = InMemoryStore::new();
        store.set_raw("k", b"v".to_vec(), Some(Duration::from_millis(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get_raw("k").await.unwrap(), None);
    }
}
