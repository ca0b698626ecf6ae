//! LRU + TTL memory cache.
//!
//! One key space, bounded by `max_size`. Capacity pressure evicts the least
//! recently used key; an entry with a TTL is invalid once its age exceeds the
//! TTL, wherever it sits in the access order. Expired entries are removed lazily
//! on access and by a periodic sweep.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::background::BackgroundTask;
use crate::clock::{Clock, system_clock, to_chrono};
use crate::error::Result;

/// Fixed per-entry overhead used by the memory estimate.
const ENTRY_OVERHEAD_BYTES: usize = 64;

fn default_max_size() -> usize {
    1000
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Seconds between expiry sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// TTL applied when `set` is called without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            default_ttl_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// A cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// Age baseline for the TTL
    pub timestamp: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now - self.timestamp > to_chrono(ttl),
            None => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub memory_bytes: usize,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Least recently used at the front
    access_order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> CacheState<V> {
    fn touch(&mut self, key: &str) {
        self.forget(key);
        self.access_order.push_back(key.to_string());
    }

    fn forget(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.forget(key);
        Some(entry)
    }
}

/// Generic LRU/TTL cache.
pub struct MemoryCache<V> {
    config: CacheConfig,
    state: RwLock<CacheState<V>>,
    clock: Arc<dyn Clock>,
    sweeper: BackgroundTask,
}

impl<V> MemoryCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                access_order: VecDeque::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            clock,
            sweeper: BackgroundTask::new("cache_cleanup"),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert or replace a value. `None` falls back to the configured default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = self.clock.now();
        let ttl = ttl.or(self.config.default_ttl_secs.map(Duration::from_secs));

        let mut state = self.state.write().await;
        let is_new = state.entries.remove(&key).is_none();
        state.forget(&key);

        if is_new && state.entries.len() >= self.config.max_size {
            if let Some(lru) = state.access_order.pop_front() {
                state.entries.remove(&lru);
                state.evictions += 1;
                debug!(key = %lru, "Evicted least recently used cache entry");
            }
        }

        state.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                timestamp: now,
                access_count: 0,
                last_accessed: now,
                ttl,
            },
        );
        state.access_order.push_back(key);
    }

    /// Fetch a value, refreshing its recency.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            state.misses += 1;
            return None;
        }

        state.hits += 1;
        state.touch(key);
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(entry.value.clone())
    }

    /// Whether a live entry exists. Does not count as an access.
    pub async fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                state.remove(key);
                false
            }
            None => false,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        state.remove(key).is_some()
    }

    /// Drop every entry. Statistics are kept.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.access_order.clear();
    }

    /// Keys in access order, least recently used first.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.access_order.iter().cloned().collect()
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn set_multiple<I, K>(&self, entries: I, ttl: Option<Duration>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        for (key, value) in entries {
            self.set(key, value, ttl).await;
        }
    }

    /// Values for the keys that are present. Misses are simply left out.
    pub async fn get_multiple<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, V> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key.as_ref()).await {
                found.insert(key.as_ref().to_string(), value);
            }
        }
        found
    }

    /// Live entries whose key matches `pattern`, in access order.
    pub async fn get_by_pattern(&self, pattern: &Regex) -> Vec<(String, V)> {
        let candidates: Vec<String> = self
            .keys()
            .await
            .into_iter()
            .filter(|k| pattern.is_match(k))
            .collect();

        let mut found = Vec::with_capacity(candidates.len());
        for key in candidates {
            if let Some(value) = self.get(&key).await {
                found.push((key, value));
            }
        }
        found
    }

    /// Replace the TTL and restart the entry's age from now.
    ///
    /// Returns `false` when the key is absent or already expired.
    pub async fn update_ttl(&self, key: &str, ttl: Option<Duration>) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.ttl = ttl;
                    entry.timestamp = now;
                }
                true
            }
            Some(true) => {
                state.remove(key);
                false
            }
            None => false,
        }
    }

    pub async fn get_stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let requests = state.hits + state.misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            state.hits as f64 / requests as f64
        };

        let memory_bytes = state
            .entries
            .iter()
            .map(|(key, entry)| {
                let value_len = serde_json::to_string(&entry.value)
                    .map(|s| s.len())
                    .unwrap_or(0);
                key.len() + value_len + ENTRY_OVERHEAD_BYTES
            })
            .sum();

        CacheStats {
            size: state.entries.len(),
            max_size: self.config.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            evictions: state.evictions,
            memory_bytes,
        }
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }

        if expired.is_empty() {
            debug!("Cache sweep found nothing to remove");
        } else {
            info!(removed = expired.len(), "Removed expired cache entries");
        }
        expired.len()
    }

    /// Return the cached value, or compute, store and return it.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Start the periodic expiry sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.sweeper
            .spawn(self.config.cleanup_interval(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(cache) => {
                            cache.cleanup_expired().await;
                            true
                        }
                        None => false,
                    }
                }
            });
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Stop the sweep and empty the cache.
    pub async fn shutdown(&self) {
        self.sweeper.stop();
        self.clear().await;
        debug!("Cache shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn cache_of(size: usize) -> MemoryCache<i32> {
        MemoryCache::new(CacheConfig::default().with_max_size(size))
    }

    fn manual_cache() -> (MemoryCache<String>, ManualClock) {
        let clock = ManualClock::new();
        let cache = MemoryCache::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let cache = cache_of(2);
        cache.set("a", 1, None).await;
        cache.set("b", 2, None).await;
        assert_eq!(cache.get("a").await, Some(1));
        cache.set("c", 3, None).await;

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
        assert_eq!(cache.get_stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_exactly_first() {
        let cache = cache_of(3);
        for (i, key) in ["k0", "k1", "k2", "k3"].iter().enumerate() {
            cache.set(*key, i as i32, None).await;
        }

        assert_eq!(cache.size().await, 3);
        assert!(!cache.has("k0").await);
        for key in ["k1", "k2", "k3"] {
            assert!(cache.has(key).await);
        }
    }

    #[tokio::test]
    async fn test_replacing_key_does_not_evict() {
        let cache = cache_of(2);
        cache.set("a", 1, None).await;
        cache.set("b", 2, None).await;
        cache.set("a", 10, None).await;

        assert_eq!(cache.size().await, 2);
        assert_eq!(cache.keys().await, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(cache.get("a").await, Some(10));
        assert_eq!(cache.get_stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (cache, clock) = manual_cache();
        cache
            .set("token", "abc".to_string(), Some(Duration::from_secs(60)))
            .await;

        clock.advance(ChronoDuration::seconds(59));
        assert_eq!(cache.get("token").await.as_deref(), Some("abc"));

        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(cache.get("token").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_no_ttl_never_expires() {
        let (cache, clock) = manual_cache();
        cache.set("forever", "v".to_string(), None).await;

        clock.advance(ChronoDuration::days(365 * 10));
        assert!(cache.has("forever").await);
        assert_eq!(cache.cleanup_expired().await, 0);
    }

    #[tokio::test]
    async fn test_recent_access_does_not_save_expired_entry() {
        let (cache, clock) = manual_cache();
        cache
            .set("hot", "h".to_string(), Some(Duration::from_secs(10)))
            .await;
        cache.set("cold", "c".to_string(), None).await;

        clock.advance(ChronoDuration::seconds(5));
        assert!(cache.get("hot").await.is_some());

        clock.advance(ChronoDuration::seconds(6));
        assert_eq!(cache.cleanup_expired().await, 1);
        assert_eq!(cache.keys().await, vec!["cold".to_string()]);
    }

    #[tokio::test]
    async fn test_update_ttl_resets_age() {
        let (cache, clock) = manual_cache();
        cache
            .set("k", "v".to_string(), Some(Duration::from_secs(10)))
            .await;

        clock.advance(ChronoDuration::seconds(8));
        assert!(cache.update_ttl("k", Some(Duration::from_secs(10))).await);

        clock.advance(ChronoDuration::seconds(8));
        assert!(cache.has("k").await);

        clock.advance(ChronoDuration::seconds(3));
        assert!(!cache.update_ttl("k", None).await);
        assert!(!cache.update_ttl("missing", None).await);
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let cache = cache_of(10);
        assert_eq!(cache.get_stats().await.hit_rate, 0.0);

        cache.set("a", 1, None).await;
        cache.get("a").await;
        cache.get("a").await;
        cache.get("a").await;
        cache.get("zzz").await;

        let stats = cache.get_stats().await;
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        // "a" + "1" + overhead
        assert_eq!(stats.memory_bytes, 1 + 1 + ENTRY_OVERHEAD_BYTES);
    }

    #[tokio::test]
    async fn test_multi_and_pattern() {
        let (cache, clock) = manual_cache();
        cache
            .set_multiple(
                vec![
                    ("lists:1", "one".to_string()),
                    ("lists:2", "two".to_string()),
                    ("items:1", "item".to_string()),
                ],
                None,
            )
            .await;
        cache
            .set("lists:3", "short".to_string(), Some(Duration::from_secs(1)))
            .await;
        clock.advance(ChronoDuration::seconds(2));

        let got = cache.get_multiple(&["lists:1", "nope", "items:1"]).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got["items:1"], "item");

        let pattern = Regex::new(r"^lists:").unwrap();
        let mut matched: Vec<String> = cache
            .get_by_pattern(&pattern)
            .await
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        matched.sort();
        assert_eq!(matched, vec!["lists:1".to_string(), "lists:2".to_string()]);
    }

    #[tokio::test]
    async fn test_get_or_set() {
        let cache = cache_of(4);
        let v = cache.get_or_set("x", None, || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);

        let v = cache
            .get_or_set("x", None, || async { Ok(99) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let clock = ManualClock::new();
        let cache = MemoryCache::with_clock(
            CacheConfig::default().with_default_ttl(Duration::from_secs(30)),
            Arc::new(clock.clone()),
        );
        cache.set("k", 1u8, None).await;
        clock.advance(ChronoDuration::seconds(31));
        assert!(!cache.has("k").await);
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_stops() {
        let cache = Arc::new(cache_of(4));
        cache.start_cleanup();
        assert!(cache.is_cleanup_running());
        cache.set("a", 1, None).await;

        cache.shutdown().await;
        assert!(!cache.is_cleanup_running());
        assert_eq!(cache.size().await, 0);
    }
}
