//! Response Cache (C4).
//!
//! Grounded on `original_source/apps/ml-service/app/utils/redis_cache.py`:
//! same key-construction formula, same get/set/delete/clear_prefix surface,
//! same graceful degradation on backend absence or error, and the same
//! `cached(...)` decorator reworked as a higher-order async function (Rust
//! has no decorator syntax — see spec.md §9 "Decorator memoization").

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-process response cache. A `dashmap::DashMap` stands in for the
/// out-of-process Redis backend the source used; the contract (deterministic
/// key, TTL, graceful degradation) is unchanged.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self { entries: DashMap::new(), default_ttl: Duration::from_secs(default_ttl_secs) }
    }

    /// `prefix ":" md5( repr(args) ":" sorted(kwargs) )[:12]`.
    pub fn generate_key(prefix: &str, args_repr: &str, sorted_kwargs_repr: &str) -> String {
        let key_data = format!("{}:{}", args_repr, sorted_kwargs_repr);
        let digest = md5::compute(key_data.as_bytes());
        let hex = format!("{:x}", digest);
        format!("{}:{}", prefix, &hex[..12])
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                tracing::info!(cache_key = key, "cache hit");
                Some(entry.value.clone())
            },
            Some(_) => {
                self.entries.remove(key);
                tracing::info!(cache_key = key, "cache miss (expired)");
                None
            },
            None => {
                tracing::info!(cache_key = key, "cache miss");
                None
            },
        }
    }

    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.insert(key.to_string(), CacheEntry { value, expires_at: Instant::now() + ttl });
        tracing::info!(cache_key = key, ttl_secs = ttl.as_secs(), "cache set");
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }
}

/// Higher-order memoization wrapper matching `redis_cache.py`'s `cached()`
/// decorator: on hit, returns the cached value without mutating it; on miss,
/// computes via `compute`, stores, and returns. A `None` cache handle yields
/// a pass-through identity wrapper (graceful degradation when the cache
/// backend is unavailable).
pub async fn memoize<T, F, Fut>(
    cache: Option<&ResponseCache>,
    key: &str,
    ttl: Option<Duration>,
    compute: F,
) -> Result<T, crate::utils::EngineError>
where
    T: Serialize + for<'de> serde::Deserialize<'de>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, crate::utils::EngineError>>,
{
    if let Some(cache) = cache
        && let Some(cached) = cache.get(key)
    {
        if let Ok(value) = serde_json::from_value(cached) {
            return Ok(value);
        }
    }

    let result = compute().await?;

    if let Some(cache) = cache
        && let Ok(json) = serde_json::to_value(&result)
    {
        cache.set(key, json, ttl);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn key_generation_is_deterministic() {
        let a = ResponseCache::generate_key("its:analyze", "()", "[('userId', 'u1')]");
        let b = ResponseCache::generate_key("its:analyze", "()", "[('userId', 'u1')]");
        assert_eq!(a, b);
        assert!(a.starts_with("its:analyze:"));
    }

    #[tokio::test]
    async fn cache_hit_returns_same_value_as_the_miss_computed() {
        let cache = ResponseCache::new(300);
        let key = "its:analyze:abc123";
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let first: i32 = memoize(Some(&cache), key, None, || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();

        let c = calls.clone();
        let second: i32 = memoize(Some(&cache), key, None, || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_cache_handle_degrades_to_pass_through() {
        let result: i32 = memoize(None, "k", None, || async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }
}
