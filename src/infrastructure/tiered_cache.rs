//! Tiered Cache
//!
//! Two-tier key/value cache with TTL expiry and LRU eviction. Entries
//! evicted from L1 are demoted into L2 instead of being discarded, and an
//! L2 hit promotes the entry back into L1.

use crate::config::ConfigError;
use crate::domain::entities::CacheEntry;
use crate::domain::ports::MetricsExport;
use crate::domain::value_objects::{CacheTier, Expiry};
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries in the fast tier
    pub l1_capacity: usize,
    /// Maximum entries in the overflow tier
    pub l2_capacity: usize,
    /// TTL applied by `Expiry::Default`
    pub default_ttl: Duration,
    /// Interval of the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            l2_capacity: 10_000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    pub fn l2_capacity(mut self, capacity: usize) -> Self {
        self.l2_capacity = capacity;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_capacity == 0 {
            return Err(ConfigError::Zero("l1_capacity"));
        }
        if self.l2_capacity == 0 {
            return Err(ConfigError::Zero("l2_capacity"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Zero("cleanup_interval"));
        }
        Ok(())
    }
}

/// Cache counters and sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub total_requests: u64,
    pub l1_size: usize,
    pub l2_size: usize,
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    /// hits / (hits + misses), 0 before the first lookup
    pub hit_ratio: f64,
}

/// One tier: entries by key plus a recency index by access stamp.
///
/// Every stamp in `recency` belongs to exactly one entry of `entries`, so
/// the first index entry is the least recently used key.
struct Tier<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
}

impl<V> Tier<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, entry: CacheEntry<V>) {
        if let Some(old) = self.entries.remove(&entry.key) {
            self.recency.remove(&old.access_seq);
        }
        self.recency.insert(entry.access_seq, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.access_seq);
        Some(entry)
    }

    /// Mark a hit and move the key to the most recent end.
    fn touch(&mut self, key: &str, seq: u64) -> Option<&CacheEntry<V>> {
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.access_seq);
        entry.touch(seq);
        self.recency.insert(seq, entry.key.clone());
        Some(entry)
    }

    fn lru_key(&self) -> Option<String> {
        self.recency.values().next().cloned()
    }

    /// Keys, least recently used first.
    fn keys(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Drop expired entries, returning how many went.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let recency = &mut self.recency;
        self.entries.retain(|_, e| {
            if e.is_expired_at(now) {
                recency.remove(&e.access_seq);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }
}

/// Both tiers and their counters, guarded by one lock.
struct CacheState<V> {
    l1: Tier<V>,
    l2: Tier<V>,
    /// Monotonic recency stamp
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    promotions: u64,
    demotions: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            l1: Tier::new(),
            l2: Tier::new(),
            seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            promotions: 0,
            demotions: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn tier(&self, tier: CacheTier) -> &Tier<V> {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }

    fn tier_mut(&mut self, tier: CacheTier) -> &mut Tier<V> {
        match tier {
            CacheTier::L1 => &mut self.l1,
            CacheTier::L2 => &mut self.l2,
        }
    }
}

/// Two-tier LRU cache.
///
/// All operations take the same lock for a short map update; values are
/// cloned out so no lock is held by callers.
pub struct TieredCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> TieredCache<V> {
    /// Create a new cache.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(CacheState::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a key up in L1, then L2.
    ///
    /// Expired entries found on the way are deleted. An L2 hit moves the
    /// entry into L1, demoting the L1 LRU entry if L1 is full.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let seq = state.next_seq();

        match state.l1.get(key).map(|e| e.is_expired_at(now)) {
            Some(false) => {
                let value = state.l1.touch(key, seq).map(|e| e.value.clone());
                state.hits += 1;
                tracing::debug!(key, tier = "l1", "cache hit");
                return value;
            }
            Some(true) => {
                state.l1.remove(key);
                state.expirations += 1;
            }
            None => {}
        }

        match state.l2.remove(key) {
            Some(entry) if entry.is_expired_at(now) => {
                state.expirations += 1;
            }
            Some(mut entry) => {
                entry.touch(seq);
                entry.tier = CacheTier::L1;
                let value = entry.value.clone();
                self.make_room(state, CacheTier::L1, now);
                state.l1.insert(entry);
                state.hits += 1;
                state.promotions += 1;
                tracing::debug!(key, tier = "l2", "cache hit, promoted to l1");
                return Some(value);
            }
            None => {}
        }

        state.misses += 1;
        tracing::debug!(key, "cache miss");
        None
    }

    /// Insert or overwrite an entry in `tier`.
    ///
    /// Any copy of the key in the other tier is removed. Overwriting a key
    /// already present in `tier` never evicts.
    pub fn set(&self, key: impl Into<String>, value: V, expiry: Expiry, tier: CacheTier) {
        let key = key.into();
        let ttl = match expiry {
            Expiry::Default => Some(self.config.default_ttl),
            Expiry::After(ttl) => Some(ttl),
            Expiry::Never => None,
        };

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let seq = state.next_seq();

        let other = match tier {
            CacheTier::L1 => CacheTier::L2,
            CacheTier::L2 => CacheTier::L1,
        };
        state.tier_mut(other).remove(&key);

        if !state.tier_mut(tier).contains_key(&key) {
            self.make_room(state, tier, now);
        }

        let entry = CacheEntry::new(key, value, ttl, tier, seq);
        state.tier_mut(tier).insert(entry);
    }

    /// Remove a key from both tiers. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let in_l1 = state.l1.remove(key).is_some();
        let in_l2 = state.l2.remove(key).is_some();
        in_l1 || in_l2
    }

    /// Clear one tier, or both when `tier` is None.
    pub fn clear(&self, tier: Option<CacheTier>) {
        let mut state = self.state.lock();
        match tier {
            Some(tier) => state.tier_mut(tier).clear(),
            None => {
                state.l1.clear();
                state.l2.clear();
            }
        }
        tracing::debug!(tier = ?tier, "cache cleared");
    }

    /// Whether a live entry exists, without counting as an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .l1
            .get(key)
            .or_else(|| state.l2.get(key))
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Snapshot of an entry and its access metadata, without touching it.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let state = self.state.lock();
        state.l1.get(key).or_else(|| state.l2.get(key)).cloned()
    }

    /// Keys of one tier, least recently used first.
    pub fn keys(&self, tier: CacheTier) -> Vec<String> {
        self.state.lock().tier(tier).keys()
    }

    /// Total entries across both tiers, including not yet purged expired ones.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.l1.len() + state.l2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry from both tiers.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let purged = state.l1.purge_expired(now) + state.l2.purge_expired(now);
        state.expirations += purged as u64;
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            promotions: state.promotions,
            demotions: state.demotions,
            total_requests: lookups,
            l1_size: state.l1.len(),
            l2_size: state.l2.len(),
            l1_capacity: self.config.l1_capacity,
            l2_capacity: self.config.l2_capacity,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    /// Evict from `tier` until it has room for one more entry.
    ///
    /// L1 victims are demoted into L2 unless already expired; L2 victims
    /// are discarded.
    fn make_room(&self, state: &mut CacheState<V>, tier: CacheTier, now: Instant) {
        let capacity = match tier {
            CacheTier::L1 => self.config.l1_capacity,
            CacheTier::L2 => self.config.l2_capacity,
        };

        while state.tier_mut(tier).len() >= capacity {
            let Some(victim_key) = state.tier(tier).lru_key() else {
                return;
            };
            let Some(mut victim) = state.tier_mut(tier).remove(&victim_key) else {
                return;
            };
            state.evictions += 1;

            if tier == CacheTier::L2 {
                tracing::debug!(key = %victim_key, "evicted from l2");
                continue;
            }
            if victim.is_expired_at(now) {
                state.expirations += 1;
                continue;
            }

            self.make_room(state, CacheTier::L2, now);
            victim.tier = CacheTier::L2;
            state.l2.insert(victim);
            state.demotions += 1;
            tracing::debug!(key = %victim_key, "evicted from l1, demoted to l2");
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TieredCache<V> {
    /// Start the periodic expiry sweep.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: &ShutdownController) {
        let cache = Arc::clone(self);
        shutdown.spawn_periodic("cache-sweeper", self.config.cleanup_interval, move || {
            let cache = cache.clone();
            async move {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "cache sweep removed expired entries");
                }
                Ok(())
            }
        });
    }
}

impl<V> Default for TieredCache<V> {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            state: Mutex::new(CacheState::new()),
        }
    }
}

impl<V: Clone> MetricsExport for TieredCache<V> {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let stats = self.stats();
        vec![
            ("cache.hits".to_string(), stats.hits as f64),
            ("cache.misses".to_string(), stats.misses as f64),
            ("cache.evictions".to_string(), stats.evictions as f64),
            ("cache.expirations".to_string(), stats.expirations as f64),
            ("cache.promotions".to_string(), stats.promotions as f64),
            ("cache.demotions".to_string(), stats.demotions as f64),
            ("cache.l1_size".to_string(), stats.l1_size as f64),
            ("cache.l2_size".to_string(), stats.l2_size as f64),
            ("cache.hit_ratio".to_string(), stats.hit_ratio),
        ]
    }
}
