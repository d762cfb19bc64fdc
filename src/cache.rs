//! JSON cache over the Redis backend.
//!
//! Keys are namespaced (`{namespace}:{hash}`) where the hash is the MD5 hex
//! digest of the canonical JSON form of whatever parameters identify the
//! cached value. Canonical means object keys are sorted, so two parameter
//! structs that serialize to the same fields always map to the same key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::redis_backend::RedisManager;

/// MD5 hex digest of the canonical JSON encoding of `params`.
pub fn hash_params<P: Serialize + ?Sized>(params: &P) -> Result<String> {
    let canonical = serde_json::to_string(&canonicalize(serde_json::to_value(params)?))?;
    Ok(format!("{:x}", md5::compute(canonical.as_bytes())))
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    redis: Arc<RedisManager>,
    namespace: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl CacheManager {
    pub fn new(redis: Arc<RedisManager>, namespace: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key_for<P: Serialize + ?Sized>(&self, params: &P) -> Result<String> {
        Ok(format!("{}:{}", self.namespace, hash_params(params)?))
    }

    /// Read and decode a cached value. A corrupt entry is dropped and treated
    /// as a miss rather than surfaced to the caller.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = match self.redis.get_raw(key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Cache(e.to_string()));
            }
        };

        match raw {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "cache hit");
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(key, error = %e, "dropping undecodable cache entry");
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.redis.delete_raw(key).await {
                        warn!(key, "failed to evict undecodable cache entry: {}", e);
                    }
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache miss");
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.redis
            .set_raw_ex(key, &bytes, ttl)
            .await
            .map_err(|e| {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Error::Cache(e.to_string())
            })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove every entry in this cache's namespace.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .redis
            .delete_prefix(&format!("{}:", self.namespace))
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        debug!(namespace = %self.namespace, removed, "cache cleared");
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self
            .redis
            .scan_pattern(&format!("{}:", self.namespace))
            .await?
            .len())
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #[test]
        fn key_depends_only_on_content(
            query in ".{0,40}",
            pairs in proptest::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..8),
            a in 1usize..100,
            b in 1usize..100,
        ) {
            let forward: serde_json::Map<String, serde_json::Value> =
                pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let backward: serde_json::Map<String, serde_json::Value> =
                pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            // Later duplicates overwrite earlier ones, so only compare when keys are unique.
            if forward == backward {
                prop_assert_eq!(
                    hash_params(&json!({"q": query, "extra": forward})).unwrap(),
                    hash_params(&json!({"extra": backward, "q": query})).unwrap()
                );
            }
            let ka = hash_params(&json!({"q": query, "limit": a})).unwrap();
            let kb = hash_params(&json!({"q": query, "limit": b})).unwrap();
            prop_assert_eq!(ka == kb, a == b);
        }
    }

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"query": "villa", "limit": 10, "location": "Dubai Marina"});
        let b = json!({"location": "Dubai Marina", "limit": 10, "query": "villa"});
        assert_eq!(hash_params(&a).unwrap(), hash_params(&b).unwrap());
        assert_ne!(
            hash_params(&a).unwrap(),
            hash_params(&json!({"query": "villa", "limit": 11})).unwrap()
        );
        assert_eq!(hash_params(&a).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn hit_miss_and_clear() {
        let cache = CacheManager::new(
            Arc::new(RedisManager::in_memory()),
            "search",
            Duration::from_secs(60),
        );
        let key = cache.key_for(&json!({"q": "studio"})).unwrap();
        assert!(key.starts_with("search:"));

        assert_eq!(cache.get::<Vec<String>>(&key).await.unwrap(), None);
        cache.set(&key, &vec!["a".to_string()], None).await.unwrap();
        assert_eq!(
            cache.get::<Vec<String>>(&key).await.unwrap(),
            Some(vec!["a".to_string()])
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let redis = Arc::new(RedisManager::in_memory());
        let cache = CacheManager::new(redis.clone(), "c", Duration::from_secs(60));
        redis.set_raw("c:bad", b"not json").await.unwrap();
        assert_eq!(cache.get::<Vec<u8>>("c:bad").await.unwrap(), None);
        assert!(!redis.exists("c:bad").await.unwrap());
    }
}
