//! Expiring key-value store.
//!
//! [`TimedCache`] remembers values for a bounded time. Every entry carries
//! its own deadline; expired entries are dropped lazily on lookup or in bulk
//! by [`TimedCache::purge_expired`]. Entries inserted with
//! [`TimedCache::insert_pinned`] never expire and are never evicted, which
//! is how the coalescer keeps in-flight work visible until it completes.
//!
//! The cache is a plain data structure; callers that share it across tasks
//! wrap it in their own lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimedCacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries dropped because their deadline passed.
    pub expirations: u64,
    /// Entries dropped to make room under the capacity limit.
    pub evictions: u64,
    /// Current number of stored entries, including not-yet-purged expired ones.
    pub size: usize,
}

impl TimedCacheStats {
    /// Returns the cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct TimedEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Option<Instant>,
}

impl<V> TimedEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// A key-value store whose entries expire after a time-to-live.
pub struct TimedCache<K, V> {
    entries: HashMap<K, TimedEntry<V>>,
    default_ttl: Duration,
    capacity: Option<usize>,
    stats: TimedCacheStats,
}

impl<K, V> TimedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates an unbounded cache whose entries live for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
            capacity: None,
            stats: TimedCacheStats::default(),
        }
    }

    /// Creates a cache holding at most `capacity` expiring entries.
    ///
    /// When full, expired entries are purged first, then the oldest
    /// expiring entry is evicted. Pinned entries do not count against the
    /// eviction choice and may push the size past `capacity`.
    pub fn with_capacity(default_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            default_ttl,
            capacity: Some(capacity),
            stats: TimedCacheStats::default(),
        }
    }

    /// Returns the default time-to-live.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Inserts a value that expires after the default TTL.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    /// Inserts a value that expires after `ttl`.
    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration) -> Option<V> {
        let now = Instant::now();
        self.store(key, value, now, Some(now + ttl))
    }

    /// Inserts a value that never expires until removed or re-timed.
    pub fn insert_pinned(&mut self, key: K, value: V) -> Option<V> {
        self.store(key, value, Instant::now(), None)
    }

    fn store(&mut self, key: K, value: V, now: Instant, expires_at: Option<Instant>) -> Option<V> {
        if !self.entries.contains_key(&key) {
            self.make_room(now);
        }

        self.entries
            .insert(
                key,
                TimedEntry {
                    value,
                    inserted_at: now,
                    expires_at,
                },
            )
            .map(|old| old.value)
    }

    fn make_room(&mut self, now: Instant) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if self.entries.len() < capacity {
            return;
        }

        self.purge_expired_at(now);

        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at.is_some())
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Returns a live value.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_mut(key).map(|value| &*value)
    }

    /// Returns a live value mutably. An expired entry is dropped and
    /// reported as absent.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        match self.entries.get_mut(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(&mut entry.value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Returns true if a live entry exists, without touching statistics.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Moves an entry's deadline. `None` pins it. Returns false if absent.
    pub fn set_expiry(&mut self, key: &K, deadline: Option<Instant>) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline;
                true
            }
            None => false,
        }
    }

    /// Returns how long a live entry has left. Pinned entries report `None`.
    pub fn remaining_ttl(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .and_then(|deadline| deadline.checked_duration_since(now))
    }

    /// Removes an entry, live or expired.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries.retain(|key, entry| keep(key, &entry.value));
    }

    /// Iterates over live values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        let now = Instant::now();
        self.entries
            .values()
            .filter(move |entry| !entry.is_expired(now))
            .map(|entry| &entry.value)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - self.entries.len();
        self.stats.expirations += purged as u64;
        purged
    }

    /// Returns the number of stored entries, including expired ones that
    /// have not been purged yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns current statistics.
    pub fn stats(&self) -> TimedCacheStats {
        TimedCacheStats {
            size: self.entries.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let mut cache = TimedCache::new(Duration::from_millis(100));
        cache.insert("k", 1);

        advance(Duration::from_millis(99)).await;
        assert_eq!(cache.get(&"k"), Some(&1));

        advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_ttl_overrides_default() {
        let mut cache = TimedCache::new(Duration::from_secs(60));
        cache.insert_with_ttl("short", "a", Duration::from_millis(10));
        cache.insert("long", "b");

        advance(Duration::from_millis(20)).await;
        assert!(!cache.contains_key(&"short"));
        assert!(cache.contains_key(&"long"));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_entries_never_expire() {
        let mut cache = TimedCache::new(Duration::from_millis(10));
        cache.insert_pinned("job", 7);

        advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.get(&"job"), Some(&7));
        assert_eq!(cache.remaining_ttl(&"job"), None);

        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(cache.set_expiry(&"job", Some(deadline)));
        assert_eq!(cache.remaining_ttl(&"job"), Some(Duration::from_millis(5)));

        advance(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&"job"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_expiring_entry() {
        let mut cache = TimedCache::with_capacity(Duration::from_secs(60), 2);
        cache.insert_pinned("pinned", 0);
        cache.insert("a", 1);
        advance(Duration::from_millis(1)).await;
        cache.insert("b", 2);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"pinned"), Some(&0));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_purging_expired() {
        let mut cache = TimedCache::with_capacity(Duration::from_secs(60), 2);
        cache.insert_with_ttl("stale", 1, Duration::from_millis(1));
        cache.insert("fresh", 2);

        advance(Duration::from_millis(2)).await;
        cache.insert("new", 3);

        assert_eq!(cache.get(&"fresh"), Some(&2));
        assert_eq!(cache.get(&"new"), Some(&3));
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_existing_key_does_not_evict() {
        let mut cache = TimedCache::with_capacity(Duration::from_secs(60), 1);
        cache.insert("k", 1);
        assert_eq!(cache.insert("k", 2), Some(1));
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get(&"k"), Some(&2));
    }

    #[test]
    fn test_get_mut_and_retain() {
        let mut cache = TimedCache::new(Duration::from_secs(60));
        cache.insert(1, 10);
        cache.insert(2, 20);

        if let Some(value) = cache.get_mut(&1) {
            *value += 1;
        }
        assert_eq!(cache.get(&1), Some(&11));

        cache.retain(|key, _| *key == 2);
        assert_eq!(cache.values().copied().collect::<Vec<_>>(), vec![20]);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_ratio_zero_total() {
        let stats = TimedCacheStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);
    }
}
