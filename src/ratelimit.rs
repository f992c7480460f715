// =============================================================================
// Rate Limiter (C3) — distributed multi-algorithm request admission
// =============================================================================
//
// Grounded on `examples/original_source/api_rate_limiting/rate_limiter.py`
// for the rule-matching/status shape, generalized to Rust tagged enums per
// the "dynamic dict-typed parameters -> tagged variant" design note. State
// lives in the shared store, not in this process, so replicas agree.
// =============================================================================

use crate::store::{rate_limit_key, SharedStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel rule name used when no configured rule matches. An unmatched
/// request is allowed under this name rather than denied.
pub const DEFAULT_RULE_NAME: &str = "__default__";

/// One hour of inactivity evicts rate-limit state.
const KEY_INACTIVITY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

impl std::str::FromStr for RuleAlgorithm {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            "fixed_window" => Ok(Self::FixedWindow),
            "leaky_bucket" => Ok(Self::LeakyBucket),
            other => Err(crate::error::CoreError::configuration(format!(
                "unknown rate limit algorithm: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RuleAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
            Self::FixedWindow => "fixed_window",
            Self::LeakyBucket => "leaky_bucket",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub name: String,
    pub algorithm: RuleAlgorithm,
    pub requests_per_second: f64,
    pub burst_size: u32,
    pub window_seconds: f64,
    pub path_patterns: Vec<String>,
    pub methods: Vec<String>,
    pub priority: i32,
}

impl RateLimitRule {
    /// `true` when `method` + `path` match this rule's patterns. The first
    /// rule (by priority) whose method and path-glob both match wins.
    pub fn matches_request(&self, path: &str, method: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        method_ok && self.path_patterns.iter().any(|p| match_glob(p, path))
    }

    /// `min(rate * window, burst)` — the effective ceiling shared by the
    /// sliding- and fixed-window algorithms.
    fn windowed_ceiling(&self) -> f64 {
        (self.requests_per_second * self.window_seconds).min(self.burst_size as f64)
    }
}

/// Hand-rolled single-`*`-wildcard glob. `*` matches any
/// run of characters within a single path segment position; a bare `*`
/// anywhere in the pattern greedily matches the rest of the string.
fn match_glob(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, suffix)) => text.starts_with(prefix) && text.ends_with(suffix) && {
            text.len() >= prefix.len() + suffix.len()
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Allowed,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub rule_name: String,
    pub remaining: i64,
    pub reset_at: f64,
    pub retry_after_sec: Option<f64>,
}

impl CheckResult {
    fn allowed(rule_name: &str, remaining: i64, reset_at: f64) -> Self {
        Self {
            status: CheckStatus::Allowed,
            rule_name: rule_name.to_string(),
            remaining,
            reset_at,
            retry_after_sec: None,
        }
    }

    fn denied(rule_name: &str, reset_at: f64, retry_after_sec: f64) -> Self {
        Self {
            status: CheckStatus::Denied,
            rule_name: rule_name.to_string(),
            remaining: 0,
            reset_at,
            retry_after_sec: Some(retry_after_sec),
        }
    }

    /// Fail-open result on store error: allowed is implied
    /// by the caller, this just reports the observation.
    fn error(rule_name: &str) -> Self {
        Self {
            status: CheckStatus::Error,
            rule_name: rule_name.to_string(),
            remaining: 0,
            reset_at: now_secs(),
            retry_after_sec: None,
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn hash_identifier(identifier: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    rules: parking_lot::RwLock<Vec<RateLimitRule>>,
    redis_errors: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            rules: parking_lot::RwLock::new(Vec::new()),
            redis_errors: AtomicU64::new(0),
        }
    }

    pub fn add_rule(&self, rule: RateLimitRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        tracing::info!(count = rules.len(), "rate limit rule added");
    }

    pub fn remove_rule(&self, name: &str) {
        self.rules.write().retain(|r| r.name != name);
    }

    pub fn redis_error_count(&self) -> u64 {
        self.redis_errors.load(Ordering::Relaxed)
    }

    fn find_rule(&self, path: &str, method: &str) -> Option<RateLimitRule> {
        self.rules
            .read()
            .iter()
            .find(|r| r.matches_request(path, method))
            .cloned()
    }

    /// Resets counters for `identifier` under `rule`, or globally when
    /// either is omitted.
    pub async fn reset(&self, identifier: Option<&str>, rule: Option<&str>) {
        let rules: Vec<String> = match rule {
            Some(r) => vec![r.to_string()],
            None => self.rules.read().iter().map(|r| r.name.clone()).collect(),
        };
        let ids: Vec<String> = identifier.map(|i| vec![i.to_string()]).unwrap_or_default();
        for rule_name in rules {
            if ids.is_empty() {
                continue;
            }
            for id in &ids {
                let hash = hash_identifier(id);
                let _ = self.store.delete(&rate_limit_key(&rule_name, &hash)).await;
            }
        }
    }

    /// Evaluates `identifier` (plus any `extra_ids`) against the highest
    /// priority matching rule. All supplied identifiers must pass, or the
    /// request is denied using the first failing identifier's `reset_at`
    /// Every supplied identifier must clear the rule independently.
    pub async fn check(
        &self,
        identifier: &str,
        path: &str,
        method: &str,
        extra_ids: &[&str],
    ) -> CheckResult {
        let Some(rule) = self.find_rule(path, method) else {
            return CheckResult::allowed(DEFAULT_RULE_NAME, i64::MAX, now_secs());
        };

        let mut all_ids = vec![identifier];
        all_ids.extend_from_slice(extra_ids);

        let mut first_denial: Option<CheckResult> = None;
        let mut last_allowed: Option<CheckResult> = None;

        for id in all_ids {
            let hash = hash_identifier(id);
            let result = self.check_one(&rule, &hash).await;
            match result.status {
                CheckStatus::Denied => {
                    first_denial = Some(result);
                    break;
                }
                CheckStatus::Error => return result,
                CheckStatus::Allowed => last_allowed = Some(result),
                _ => {}
            }
        }

        first_denial.or(last_allowed).unwrap_or_else(|| CheckResult::allowed(&rule.name, 0, now_secs()))
    }

    async fn check_one(&self, rule: &RateLimitRule, identifier_hash: &str) -> CheckResult {
        let result = match rule.algorithm {
            RuleAlgorithm::TokenBucket => self.check_token_bucket(rule, identifier_hash).await,
            RuleAlgorithm::SlidingWindow => self.check_sliding_window(rule, identifier_hash).await,
            RuleAlgorithm::FixedWindow => self.check_fixed_window(rule, identifier_hash).await,
            RuleAlgorithm::LeakyBucket => self.check_leaky_bucket(rule, identifier_hash).await,
        };
        match result {
            Ok(r) => r,
            Err(e) => {
                self.redis_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, rule = %rule.name, "rate limit store error, failing open");
                CheckResult::error(&rule.name)
            }
        }
    }

    async fn check_token_bucket(&self, rule: &RateLimitRule, id_hash: &str) -> crate::error::CoreResult<CheckResult> {
        let key = rate_limit_key("token_bucket", &format!("{}:{id_hash}", rule.name));
        let now = now_secs();
        let burst = rule.burst_size as f64;
        let rate = rule.requests_per_second;
        let mut allowed = false;
        let mut tokens_after = 0.0;
        self.store
            .eval_atomic(&key, &mut |cur| {
                let (mut tokens, last_refill) = cur
                    .and_then(|b| serde_json::from_slice::<(f64, f64)>(b).ok())
                    .unwrap_or((burst, now));
                let elapsed = (now - last_refill).max(0.0);
                tokens = (tokens + elapsed * rate).min(burst);
                if tokens >= 1.0 {
                    tokens -= 1.0;
                    allowed = true;
                }
                tokens_after = tokens;
                Some(serde_json::to_vec(&(tokens, now)).unwrap())
            })
            .await?;
        self.store.expire(&key, KEY_INACTIVITY_TTL).await?;
        if allowed {
            Ok(CheckResult::allowed(&rule.name, tokens_after as i64, now + (1.0 - tokens_after) / rate.max(f64::EPSILON)))
        } else {
            let retry_after = (1.0 - tokens_after) / rate.max(f64::EPSILON);
            Ok(CheckResult::denied(&rule.name, now + retry_after, retry_after))
        }
    }

    async fn check_sliding_window(&self, rule: &RateLimitRule, id_hash: &str) -> crate::error::CoreResult<CheckResult> {
        let key = rate_limit_key("sliding_window", &format!("{}:{id_hash}", rule.name));
        let now = now_secs();
        let window = rule.window_seconds;
        self.store.zremrangebyscore(&key, f64::MIN, now - window).await?;
        let current = self.store.zrange_by_score(&key, f64::MIN, f64::MAX).await?;
        let ceiling = rule.windowed_ceiling();
        if (current.len() as f64) < ceiling {
            self.store.zadd(&key, &format!("{now}"), now).await?;
            self.store.expire(&key, KEY_INACTIVITY_TTL).await?;
            let remaining = ceiling as i64 - current.len() as i64 - 1;
            Ok(CheckResult::allowed(&rule.name, remaining.max(0), now + window))
        } else {
            let oldest = current.first().map(|(_, s)| *s).unwrap_or(now);
            let retry_after = (oldest + window - now).max(0.0);
            Ok(CheckResult::denied(&rule.name, oldest + window, retry_after))
        }
    }

    async fn check_fixed_window(&self, rule: &RateLimitRule, id_hash: &str) -> crate::error::CoreResult<CheckResult> {
        let now = now_secs();
        let window = rule.window_seconds.max(1.0);
        let epoch = (now / window).floor() as i64;
        let key = rate_limit_key("fixed_window", &format!("{}:{id_hash}:{epoch}", rule.name));
        let ceiling = rule.windowed_ceiling();
        let count = self
            .store
            .incr_with_expiry(&key, Duration::from_secs_f64(window + 5.0))
            .await?;
        let reset_at = (epoch as f64 + 1.0) * window;
        if (count as f64) <= ceiling {
            Ok(CheckResult::allowed(&rule.name, (ceiling as i64 - count).max(0), reset_at))
        } else {
            Ok(CheckResult::denied(&rule.name, reset_at, (reset_at - now).max(0.0)))
        }
    }

    async fn check_leaky_bucket(&self, rule: &RateLimitRule, id_hash: &str) -> crate::error::CoreResult<CheckResult> {
        let key = rate_limit_key("leaky_bucket", &format!("{}:{id_hash}", rule.name));
        let now = now_secs();
        let burst = rule.burst_size as f64;
        let rate = rule.requests_per_second;
        let mut allowed = false;
        let mut volume_after = 0.0;
        self.store
            .eval_atomic(&key, &mut |cur| {
                let (mut volume, last_leak) = cur
                    .and_then(|b| serde_json::from_slice::<(f64, f64)>(b).ok())
                    .unwrap_or((0.0, now));
                let elapsed = (now - last_leak).max(0.0);
                volume = (volume - elapsed * rate).max(0.0);
                if volume < burst {
                    volume += 1.0;
                    allowed = true;
                }
                volume_after = volume;
                Some(serde_json::to_vec(&(volume, now)).unwrap())
            })
            .await?;
        self.store.expire(&key, KEY_INACTIVITY_TTL).await?;
        let remaining = (burst - volume_after).max(0.0) as i64;
        if allowed {
            Ok(CheckResult::allowed(&rule.name, remaining, now + volume_after / rate.max(f64::EPSILON)))
        } else {
            let retry_after = (volume_after - burst + 1.0) / rate.max(f64::EPSILON);
            Ok(CheckResult::denied(&rule.name, now + retry_after, retry_after))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use proptest::prelude::*;

    fn rule(name: &str, algorithm: RuleAlgorithm, rps: f64, burst: u32, window: f64) -> RateLimitRule {
        RateLimitRule {
            name: name.to_string(),
            algorithm,
            requests_per_second: rps,
            burst_size: burst,
            window_seconds: window,
            path_patterns: vec!["*".to_string()],
            methods: vec![],
            priority: 1,
        }
    }

    #[tokio::test]
    async fn unmatched_request_uses_sentinel_name() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        let r = limiter.check("user1", "/orders", "GET", &[]).await;
        assert_eq!(r.status, CheckStatus::Allowed);
        assert_eq!(r.rule_name, DEFAULT_RULE_NAME);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        // scenario 4: rate=5/s, burst=5. Five rapid requests empty the
        // bucket; a request at t=0.6s allows (3 tokens refilled).
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        limiter.add_rule(rule("orders", RuleAlgorithm::TokenBucket, 5.0, 5, 1.0));
        for _ in 0..5 {
            let r = limiter.check("u", "/orders", "POST", &[]).await;
            assert_eq!(r.status, CheckStatus::Allowed);
        }
        let r = limiter.check("u", "/orders", "POST", &[]).await;
        assert_eq!(r.status, CheckStatus::Denied);
    }

    #[tokio::test]
    async fn sliding_window_denies_eleventh_request() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        limiter.add_rule(rule("orders", RuleAlgorithm::SlidingWindow, 10.0, 10, 1.0));
        for _ in 0..10 {
            let r = limiter.check("u", "/orders", "POST", &[]).await;
            assert_eq!(r.status, CheckStatus::Allowed);
        }
        let r = limiter.check("u", "/orders", "POST", &[]).await;
        assert_eq!(r.status, CheckStatus::Denied);
    }

    #[tokio::test]
    async fn multi_identifier_requires_all_to_pass() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        limiter.add_rule(rule("orders", RuleAlgorithm::TokenBucket, 1.0, 1, 1.0));
        let first = limiter.check("user", "/orders", "POST", &["ip"]).await;
        assert_eq!(first.status, CheckStatus::Allowed);
        // "user" bucket now empty; "ip" bucket fresh — overall must deny.
        let second = limiter.check("user", "/orders", "POST", &["ip"]).await;
        assert_eq!(second.status, CheckStatus::Denied);
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        let mut low = rule("generic", RuleAlgorithm::TokenBucket, 100.0, 100, 1.0);
        low.priority = 1;
        let mut high = rule("orders-specific", RuleAlgorithm::TokenBucket, 1.0, 1, 1.0);
        high.priority = 10;
        high.path_patterns = vec!["/orders".to_string()];
        limiter.add_rule(low);
        limiter.add_rule(high);
        let r = limiter.check("u", "/orders", "POST", &[]).await;
        assert_eq!(r.rule_name, "orders-specific");
    }

    #[test]
    fn glob_matches_prefix_wildcard() {
        assert!(match_glob("/orders/*", "/orders/123"));
        assert!(!match_glob("/orders/*", "/accounts/1"));
        assert!(match_glob("*", "anything"));
        assert!(match_glob("/exact", "/exact"));
    }

    #[test]
    fn unknown_algorithm_is_configuration_error() {
        use std::str::FromStr;
        let err = RuleAlgorithm::from_str("bogus").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Configuration);
        assert!(!err.is_retryable());
    }

    proptest! {
        /// spec §8: "∀ rate-limit rule r and identifier i, under any
        /// interleaving of concurrent checks, the accepted rate does not
        /// exceed r.requests_per_second * window + r.burst_size." Back to
        /// back calls against a fresh bucket are the tightest case: at most
        /// `burst` may be admitted before refill catches up.
        #[test]
        fn token_bucket_never_admits_more_than_burst_back_to_back(
            burst in 1u32..20,
            attempts in 1usize..40,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
                limiter.add_rule(rule("orders", RuleAlgorithm::TokenBucket, 0.001, burst, 1.0));
                let mut allowed = 0u32;
                for _ in 0..attempts {
                    let r = limiter.check("u", "/orders", "POST", &[]).await;
                    if r.status == CheckStatus::Allowed {
                        allowed += 1;
                    }
                }
                prop_assert!(allowed <= burst);
                Ok(())
            })?;
        }

        /// spec §8: sliding window with rate*window = N allows exactly N
        /// requests in any sliding second-resolution window.
        #[test]
        fn sliding_window_never_admits_more_than_ceiling_back_to_back(
            n in 1u32..20,
            attempts in 1usize..40,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
                limiter.add_rule(rule("orders", RuleAlgorithm::SlidingWindow, n as f64, n, 1.0));
                let mut allowed = 0u32;
                for _ in 0..attempts {
                    let r = limiter.check("u", "/orders", "POST", &[]).await;
                    if r.status == CheckStatus::Allowed {
                        allowed += 1;
                    }
                }
                prop_assert!(allowed <= n);
                Ok(())
            })?;
        }
    }
}
