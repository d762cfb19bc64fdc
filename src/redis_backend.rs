use crate::{
    config::RedisConfig,
    error::{Error, Result},
};
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use parking_lot::RwLock as SyncRwLock;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
enum Slot {
    Bytes(Vec<u8>),
    SortedSet(Vec<(String, f64)>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            expires_at: None,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory stand-in used when Redis is unavailable. Mirrors the subset of
/// Redis semantics the rest of the crate relies on, including key expiry.
#[derive(Default, Clone)]
struct FallbackStore {
    inner: Arc<SyncRwLock<HashMap<String, Entry>>>,
}

impl FallbackStore {
    fn live<R>(&self, key: &str, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        let guard = self.inner.read();
        guard.get(key).filter(|e| e.is_live()).map(|e| f(&e.slot))
    }

    fn with_slot<R>(&self, key: &str, init: impl FnOnce() -> Slot, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut guard = self.inner.write();
        let stale = guard.get(key).map_or(false, |e| !e.is_live());
        if stale {
            guard.remove(key);
        }
        let entry = guard.entry(key.to_string()).or_insert_with(|| Entry::new(init()));
        f(&mut entry.slot)
    }

    fn with_existing<R>(&self, key: &str, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let mut guard = self.inner.write();
        match guard.get_mut(key) {
            Some(entry) if entry.is_live() => Some(f(&mut entry.slot)),
            _ => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.inner.write().insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.live(key, |slot| match slot {
            Slot::Bytes(v) => Some(v.clone()),
            _ => None,
        })
        .flatten()
    }

    fn del(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.live(key, |_| ()).is_some()
    }

    fn expire(&self, key: &str, ttl: Duration) {
        if let Some(entry) = self.inner.write().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Resolve a Redis-style inclusive `start..=stop` range (negative indexes
/// count from the end) against a collection of `len` items.
fn redis_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

enum Backend {
    Redis(Pool<RedisConnectionManager>),
    Memory(FallbackStore),
}

pub struct RedisManager {
    backend: Backend,
    stats: Arc<RwLock<RedisStats>>,
}

#[derive(Debug, Default)]
struct RedisStats {
    total_operations: u64,
    failed_operations: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl RedisManager {
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let mut last_err: Option<String> = None;
        for attempt in 0..=config.max_retries {
            match Self::connect(config).await {
                Ok(pool) => {
                    info!("Connected to Redis at {}", config.url);
                    return Ok(Self::from_pool(pool));
                }
                Err(e) => {
                    warn!("Redis connection attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
            tokio::time::sleep(config.retry_delay).await;
        }

        if config.enable_fallback {
            warn!(
                "Falling back to in-memory store (Redis unreachable: {:?}); state will not be shared across workers",
                last_err
            );
            return Ok(Self::in_memory());
        }

        Err(Error::Redis(format!(
            "Failed to connect to Redis after retries: {:?}",
            last_err
        )))
    }

    async fn connect(config: &RedisConfig) -> Result<Pool<RedisConnectionManager>> {
        let manager = RedisConnectionManager::new(config.url.as_str())
            .map_err(|e| Error::Redis(format!("Failed to create Redis manager: {}", e)))?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .await
            .map_err(|e| Error::Redis(format!("Failed to build Redis pool: {}", e)))?;

        // The pool is built lazily, so verify the server actually answers.
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| Error::Redis(format!("Failed to get connection from pool: {}", e)))?;
            redis::cmd("PING")
                .query_async::<String>(&mut *conn)
                .await
                .map_err(|e| Error::Redis(format!("Ping failed: {}", e)))?;
        }
        Ok(pool)
    }

    pub fn from_pool(pool: Pool<RedisConnectionManager>) -> Self {
        Self {
            backend: Backend::Redis(pool),
            stats: Arc::new(RwLock::new(RedisStats::default())),
        }
    }

    /// Process-local store, used by tests and single-worker development.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(FallbackStore::default()),
            stats: Arc::new(RwLock::new(RedisStats::default())),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }

    async fn get_connection<'a>(
        &self,
        pool: &'a Pool<RedisConnectionManager>,
    ) -> Result<PooledConnection<'a, RedisConnectionManager>> {
        match pool.get().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.stats.write().await.failed_operations += 1;
                Err(Error::Redis(format!("Failed to get connection from pool: {}", e)))
            }
        }
    }

    /// Get raw data by key
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = match &self.backend {
            Backend::Memory(store) => store.get(key),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.get(key)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to get key {}: {}", key, e)))?
            }
        };
        self.update_stats(result.is_some()).await;
        Ok(result)
    }

    /// Store raw data with key
    pub async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.set(key, value.to_vec(), None),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .set(key, value)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to set key {}: {}", key, e)))?;
            }
        }
        self.update_stats(true).await;
        Ok(())
    }

    /// Store raw data with key and TTL. Sub-second TTLs round up to one second.
    pub async fn set_raw_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.set(key, value.to_vec(), Some(ttl)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to set key {} with TTL: {}", key, e)))?;
            }
        }
        self.update_stats(true).await;
        Ok(())
    }

    /// Delete key, returning whether it existed
    pub async fn delete_raw(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.del(key)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let removed: i64 = conn
                    .del(key)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to delete key {}: {}", key, e)))?;
                Ok(removed > 0)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(store) => Ok(store.exists(key)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.exists(key).await.map_err(|e| {
                    Error::Redis(format!("Failed to check existence of key {}: {}", key, e))
                })
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.expire(key, ttl),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .expire(key, ttl.as_secs().max(1) as i64)
                    .await
                    .map_err(|e| {
                        Error::Redis(format!("Failed to set expiration for key {}: {}", key, e))
                    })?;
            }
        }
        Ok(())
    }

    /// Scan keys matching a prefix.
    pub async fn scan_pattern(&self, prefix: &str) -> Result<Vec<String>> {
        let pool = match &self.backend {
            Backend::Memory(store) => return Ok(store.scan_prefix(prefix)),
            Backend::Redis(pool) => pool,
        };
        let mut cursor = 0u64;
        let mut keys_acc = Vec::new();
        let mut conn = self.get_connection(pool).await?;
        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", prefix))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys_acc.extend(keys);
            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys_acc)
    }

    /// Delete every key under `prefix`, returning how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.scan_pattern(prefix).await?;
        let mut removed = 0;
        for key in &keys {
            if self.delete_raw(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.with_slot(
                key,
                || Slot::SortedSet(Vec::new()),
                |slot| {
                    if let Slot::SortedSet(members) = slot {
                        members.retain(|(m, _)| m != member);
                        members.push((member.to_string(), score));
                        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                    }
                },
            ),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .zadd(key, member, score)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to zadd to {}: {}", key, e)))?;
            }
        }
        Ok(())
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .with_existing(key, |slot| match slot {
                    Slot::SortedSet(members) => {
                        let before = members.len();
                        members.retain(|(m, _)| m != member);
                        members.len() != before
                    }
                    _ => false,
                })
                .unwrap_or(false)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let removed: i64 = conn
                    .zrem(key, member)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to zrem from {}: {}", key, e)))?;
                Ok(removed > 0)
            }
        }
    }

    /// Members of a sorted set, lowest score first.
    pub async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .live(key, |slot| match slot {
                    Slot::SortedSet(members) => members.iter().map(|(m, _)| m.clone()).collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default()),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.zrange(key, 0, -1)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to zrange {}: {}", key, e)))
            }
        }
    }

    /// Remove members scored at or below `max`. Returns how many were removed.
    pub async fn zrem_up_to(&self, key: &str, max: f64) -> Result<usize> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .with_existing(key, |slot| match slot {
                    Slot::SortedSet(members) => {
                        let before = members.len();
                        members.retain(|(_, score)| *score > max);
                        before - members.len()
                    }
                    _ => 0,
                })
                .unwrap_or(0)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.zrembyscore(key, "-inf", max)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to zremrangebyscore {}: {}", key, e)))
            }
        }
    }

    pub async fn zcard(&self, key: &str) -> Result<usize> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .live(key, |slot| match slot {
                    Slot::SortedSet(members) => members.len(),
                    _ => 0,
                })
                .unwrap_or(0)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.zcard(key)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to zcard {}: {}", key, e)))
            }
        }
    }

    pub async fn rpush(&self, key: &str, value: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.with_slot(
                key,
                || Slot::List(VecDeque::new()),
                |slot| {
                    if let Slot::List(items) = slot {
                        items.push_back(value.to_vec());
                    }
                },
            ),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .rpush(key, value)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to rpush to {}: {}", key, e)))?;
            }
        }
        Ok(())
    }

    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => {
                store.with_existing(key, |slot| {
                    if let Slot::List(items) = slot {
                        *items = match redis_range(items.len(), start, stop) {
                            Some((s, e)) => items.drain(s..=e).collect(),
                            None => VecDeque::new(),
                        };
                    }
                });
            }
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .ltrim(key, start, stop)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to ltrim {}: {}", key, e)))?;
            }
        }
        Ok(())
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .live(key, |slot| match slot {
                    Slot::List(items) => match redis_range(items.len(), start, stop) {
                        Some((s, e)) => items.range(s..=e).cloned().collect(),
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                })
                .unwrap_or_default()),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.lrange(key, start, stop)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to lrange {}: {}", key, e)))
            }
        }
    }

    pub async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => store.with_slot(
                key,
                || Slot::Hash(HashMap::new()),
                |slot| {
                    if let Slot::Hash(map) = slot {
                        map.insert(field.to_string(), value.to_vec());
                    }
                },
            ),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let _: () = conn
                    .hset(key, field, value)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to hset {}:{}: {}", key, field, e)))?;
            }
        }
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .live(key, |slot| match slot {
                    Slot::Hash(map) => map.get(field).cloned(),
                    _ => None,
                })
                .flatten()),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.hget(key, field)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to hget {}:{}: {}", key, field, e)))
            }
        }
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .live(key, |slot| match slot {
                    Slot::Hash(map) => map.clone(),
                    _ => HashMap::new(),
                })
                .unwrap_or_default()),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                conn.hgetall(key)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to hgetall {}: {}", key, e)))
            }
        }
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(store) => Ok(store
                .with_existing(key, |slot| match slot {
                    Slot::Hash(map) => map.remove(field).is_some(),
                    _ => false,
                })
                .unwrap_or(false)),
            Backend::Redis(pool) => {
                let mut conn = self.get_connection(pool).await?;
                let removed: i64 = conn
                    .hdel(key, field)
                    .await
                    .map_err(|e| Error::Redis(format!("Failed to hdel {}:{}: {}", key, field, e)))?;
                Ok(removed > 0)
            }
        }
    }

    pub async fn health_check(&self) -> Result<bool> {
        let pool = match &self.backend {
            Backend::Memory(_) => return Ok(true),
            Backend::Redis(pool) => pool,
        };
        match pool.get().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut *conn).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!("Redis health check failed: {}", e);
                    Ok(false)
                }
            },
            Err(e) => {
                error!("Failed to get Redis connection for health check: {}", e);
                Ok(false)
            }
        }
    }

    async fn update_stats(&self, cache_hit: bool) {
        let mut stats = self.stats.write().await;
        stats.total_operations += 1;
        if cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
    }

    pub async fn get_stats(&self) -> HashMap<String, u64> {
        let stats = self.stats.read().await;
        let mut result = HashMap::new();
        result.insert("total_operations".to_string(), stats.total_operations);
        result.insert("failed_operations".to_string(), stats.failed_operations);
        result.insert("cache_hits".to_string(), stats.cache_hits);
        result.insert("cache_misses".to_string(), stats.cache_misses);

        if stats.total_operations > 0 {
            let hit_rate = (stats.cache_hits as f64 / stats.total_operations as f64 * 100.0) as u64;
            result.insert("cache_hit_rate".to_string(), hit_rate);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_range_matches_redis_semantics() {
        assert_eq!(redis_range(5, 0, -1), Some((0, 4)));
        assert_eq!(redis_range(5, -2, -1), Some((3, 4)));
        assert_eq!(redis_range(5, 1, 10), Some((1, 4)));
        assert_eq!(redis_range(5, -10, 1), Some((0, 1)));
        assert_eq!(redis_range(5, 3, 1), None);
        assert_eq!(redis_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn fallback_kv_and_ttl() {
        let redis = RedisManager::in_memory();
        redis.set_raw("a", b"1").await.unwrap();
        assert_eq!(redis.get_raw("a").await.unwrap(), Some(b"1".to_vec()));

        redis
            .set_raw_ex("short", b"x", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(redis.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!redis.exists("short").await.unwrap());
        assert_eq!(redis.get_raw("short").await.unwrap(), None);

        assert!(redis.delete_raw("a").await.unwrap());
        assert!(!redis.delete_raw("a").await.unwrap());
    }

    #[tokio::test]
    async fn fallback_sorted_set_orders_by_score() {
        let redis = RedisManager::in_memory();
        redis.zadd("z", "late", 3.0).await.unwrap();
        redis.zadd("z", "early", 1.0).await.unwrap();
        redis.zadd("z", "mid", 2.0).await.unwrap();
        assert_eq!(redis.zrange_all("z").await.unwrap(), vec!["early", "mid", "late"]);
        assert!(redis.zrem("z", "mid").await.unwrap());
        assert_eq!(redis.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fallback_list_trim_keeps_tail() {
        let redis = RedisManager::in_memory();
        for i in 0..5u8 {
            redis.rpush("l", &[i]).await.unwrap();
        }
        redis.ltrim("l", -3, -1).await.unwrap();
        let items = redis.lrange("l", 0, -1).await.unwrap();
        assert_eq!(items, vec![vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn fallback_prefix_delete_and_hash() {
        let redis = RedisManager::in_memory();
        redis.set_raw("search:1", b"a").await.unwrap();
        redis.set_raw("search:2", b"b").await.unwrap();
        redis.set_raw("other", b"c").await.unwrap();
        assert_eq!(redis.delete_prefix("search:").await.unwrap(), 2);
        assert!(redis.exists("other").await.unwrap());

        redis.hset("h", "f", b"v").await.unwrap();
        assert_eq!(redis.hget("h", "f").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(redis.hgetall("h").await.unwrap().len(), 1);
        assert!(redis.hdel("h", "f").await.unwrap());
    }
}
