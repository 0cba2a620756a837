use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache_key;

/// Configuration for QueryCache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// Maximum number of entries in the cache
    pub max_size: usize,
    /// Period of the background expiry sweep
    pub cleanup_interval: Duration,
    /// Share of entries evicted when the cache is full
    pub eviction_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
            eviction_fraction: 0.1,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            default_ttl,
            max_size,
            ..Self::default()
        }
    }

    /// Set the interval of the background sweep
    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    /// Set the share of entries evicted at capacity, clamped to `(0, 1]`
    pub fn with_eviction_fraction(mut self, eviction_fraction: f64) -> Self {
        self.eviction_fraction = eviction_fraction;
        self
    }
}

/// Statistics for cache operations
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStatistics {
    /// Get the number of cache hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get the number of cache misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get the number of entries removed by LRU eviction
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get the number of entries removed by explicit or tag invalidation
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Calculate the cache hit rate (hits / (hits + misses))
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn reset_lookups(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache state returned by [`QueryCache::stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Human readable estimate, e.g. `12.4 KB`
    pub memory_usage: String,
    pub memory_bytes: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// A cached value with its expiry and access metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
    pub tags: HashSet<String>,
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn has_any_tag(&self, tags: &[&str]) -> bool {
        tags.iter().any(|tag| self.tags.contains(*tag))
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Monotonic access sequence, orders entries that share an access instant
    access_seq: u64,
}

impl<V> CacheState<V> {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }
}

/// In-process query result cache with TTL expiry, tag invalidation and
/// batched LRU eviction.
///
/// Expiry is checked lazily on every lookup; the background sweep started by
/// [`QueryCache::start_sweeper`] only reclaims memory.
pub struct QueryCache<V = Value> {
    state: RwLock<CacheState<V>>,
    config: CacheConfig,
    statistics: CacheStatistics,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Serialize> QueryCache<V> {
    /// Creates a new empty cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                access_seq: 0,
            }),
            config,
            statistics: CacheStatistics::default(),
            sweeper: Mutex::new(None),
        }
    }

    /// Gets a value, or None if absent or expired
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.write();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.statistics.record_miss();
                return None;
            }
        };

        if expired {
            state.entries.remove(key);
            self.statistics.record_miss();
            return None;
        }

        let seq = state.next_seq();
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        entry.access_seq = seq;
        self.statistics.record_hit();
        Some(entry.value.clone())
    }

    /// Inserts or replaces a value.
    ///
    /// `ttl` of None or zero uses the configured default. Inserting a new key
    /// into a full cache first evicts the least recently accessed share of
    /// entries.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[&str]) {
        if self.config.max_size == 0 {
            return;
        }

        let ttl = ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.config.default_ttl);
        let now = Instant::now();

        let mut state = self.state.write();
        if !state.entries.contains_key(key) && state.entries.len() >= self.config.max_size {
            self.evict_least_recently_used(&mut state);
        }

        let seq = state.next_seq();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                created_at: Utc::now(),
                inserted_at: now,
                expires_at: now + ttl,
                access_count: 0,
                last_accessed: now,
                tags: tags.iter().map(|tag| tag.to_string()).collect(),
                access_seq: seq,
            },
        );
    }

    /// Returns the cached value, or runs `fetcher` and caches its result.
    ///
    /// A failing fetcher caches nothing and its error is returned unchanged.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }

        match fetcher().await {
            Ok(value) => {
                self.set(key, value.clone(), ttl, tags);
                Ok(value)
            }
            Err(e) => {
                error!("Cache fetcher failed for key '{}': {}", key, e);
                Err(e)
            }
        }
    }

    /// Removes one entry, returning whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.state.write().entries.remove(key).is_some();
        if removed {
            self.statistics.record_invalidations(1);
        }
        removed
    }

    /// Removes every entry carrying at least one of `tags`
    pub fn invalidate_by_tags(&self, tags: &[&str]) -> usize {
        if tags.is_empty() {
            return 0;
        }

        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.has_any_tag(tags));
        let removed = before - state.entries.len();
        drop(state);

        self.statistics.record_invalidations(removed);
        removed
    }

    /// Builds a deterministic key, see [`cache_key::generate_key`]
    pub fn generate_key(&self, operation: &str, params: &Value) -> String {
        cache_key::generate_key(operation, params)
    }

    /// Checks for a live entry without affecting statistics
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .read()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Returns a copy of the entry, including expired ones not yet swept
    pub fn inspect(&self, key: &str) -> Option<CacheEntry<V>> {
        self.state.read().entries.get(key).cloned()
    }

    /// Returns the number of physically present entries
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Clears all entries and resets hit/miss counters
    pub fn clear(&self) {
        self.state.write().entries.clear();
        self.statistics.reset_lookups();
    }

    /// Gets the cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Gets the raw counters
    pub fn statistics(&self) -> &CacheStatistics {
        &self.statistics
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        let memory_bytes: usize = state
            .entries
            .values()
            .map(|entry| {
                let value_len = serde_json::to_string(&entry.value)
                    .map(|json| json.len())
                    .unwrap_or(0);
                entry.key.len() * 2 + value_len * 2 + 100
            })
            .sum();
        let oldest_entry = state.entries.values().map(|entry| entry.created_at).min();
        let newest_entry = state.entries.values().map(|entry| entry.created_at).max();

        CacheStats {
            size: state.entries.len(),
            hits: self.statistics.hits(),
            misses: self.statistics.misses(),
            hit_rate: self.statistics.hit_rate(),
            evictions: self.statistics.evictions(),
            invalidations: self.statistics.invalidations(),
            memory_usage: format_bytes(memory_bytes as u64),
            memory_bytes,
            oldest_entry,
            newest_entry,
        }
    }

    /// Removes every expired entry, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .state
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let mut state = self.state.write();
        let mut removed = 0;
        for key in expired {
            // re-check: the key may have been set again since the scan
            if state.entries.get(&key).is_some_and(|entry| entry.is_expired(now)) {
                state.entries.remove(&key);
                removed += 1;
            }
        }
        drop(state);

        if removed > 0 {
            info!("Cache cleanup: removed {} expired entries", removed);
        }
        removed
    }

    /// Stops the background sweep and clears all entries
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.clear();
    }

    fn evict_least_recently_used(&self, state: &mut CacheState<V>) {
        let fraction = self.config.eviction_fraction.clamp(f64::EPSILON, 1.0);
        // epsilon keeps float noise (30 * 0.1 = 3.0000000000000004) from rounding up
        let share = state.entries.len() as f64 * fraction - 1e-9;
        let to_remove = (share.ceil() as usize).max(1);

        let mut candidates: Vec<(u64, String)> = state
            .entries
            .values()
            .map(|entry| (entry.access_seq, entry.key.clone()))
            .collect();
        candidates.sort_unstable();

        for (_, key) in candidates.into_iter().take(to_remove) {
            state.entries.remove(&key);
        }

        self.statistics.record_evictions(to_remove);
        debug!("Cache full: evicted {} least recently used entries", to_remove);
    }
}

impl<V: Clone + Serialize + Send + Sync + 'static> QueryCache<V> {
    /// Spawns the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped. Calling this again replaces the running sweep.
    pub fn start_sweeper(self: &Arc<Self>) {
        let cache = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.cleanup();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl<V> Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("statistics", &self.statistics)
            .finish_non_exhaustive()
    }
}

/// Formats a byte count as `B`, `KB` or `MB`
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}
