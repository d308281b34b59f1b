use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::Sweep;
use crate::config::CachePolicy;

/// Statistics about cache performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Times a value was computed through `get_or_compute`
    pub populations: u64,
    /// Entries dropped because they outlived the timeout
    pub expirations: u64,
    pub entry_count: usize,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    populations: AtomicU64,
    expirations: AtomicU64,
}

struct CacheEntry<V> {
    value: V,
    inserted: Instant,
}

/// Slot shared by every caller waiting on the same population
type InFlight<V> = Arc<Mutex<Option<V>>>;

/// Concurrent key-value cache with timed entries.
///
/// Expiry is enforced on read, so a stale entry is never returned no matter
/// when the sweeper last ran. Concurrent `get_or_compute` calls for one key
/// share a single computation.
pub struct ExpiringCache<K, V> {
    name: String,
    entries: DashMap<K, CacheEntry<V>>,
    in_flight: DashMap<K, InFlight<V>>,
    policy: CachePolicy,
    counters: CacheCounters,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(name: impl Into<String>, policy: CachePolicy) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            policy,
            counters: CacheCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.policy.timeout {
            Some(timeout) => now.saturating_duration_since(entry.inserted) > timeout,
            None => true,
        }
    }

    /// Cached value for `key`, if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if !self.is_expired(&entry, now) {
                    if self.policy.refresh_on_access {
                        entry.inserted = now;
                    }
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };

        // Re-check under the shard lock so a fresh replacement survives
        if expired
            && self
                .entries
                .remove_if(key, |_, entry| self.is_expired(entry, now))
                .is_some()
        {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value. A no-op when caching is disabled.
    pub fn put(&self, key: K, value: V) {
        if !self.policy.is_enabled() {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop the entry and abandon any population in progress for it
    pub fn remove(&self, key: &K) -> Option<V> {
        self.in_flight.remove(key);
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map_or(false, |entry| !self.is_expired(&entry, now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.in_flight.clear();
        self.entries.clear();
    }

    /// Age of the entry for `key`
    pub fn age(&self, key: &K) -> Option<Duration> {
        self.entries.get(key).map(|entry| entry.inserted.elapsed())
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !self.is_expired(entry, now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Cached value for `key`, computing it on a miss.
    ///
    /// At most one `compute` runs per key at a time; every caller that arrives
    /// while it runs waits for and shares its result. Errors are not cached,
    /// and a result whose key was removed mid-computation is handed to its
    /// waiters but not stored.
    pub fn get_or_compute<E, F>(&self, key: &K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        loop {
            if let Some(value) = self.get(key) {
                return Ok(value);
            }

            let slot: InFlight<V> = Arc::clone(
                self.in_flight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .value(),
            );
            let mut guard = slot.lock();

            if let Some(value) = guard.as_ref() {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }
            if let Some(value) = self.get(key) {
                return Ok(value);
            }
            if !self.is_current_flight(key, &slot) {
                // Previous owner failed or the key was removed; start over
                continue;
            }

            self.counters.populations.fetch_add(1, Ordering::Relaxed);
            log::trace!("{}: populating {:?}", self.name, key);
            let value = match compute() {
                Ok(value) => value,
                Err(error) => {
                    self.in_flight.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
                    drop(guard);
                    return Err(error);
                }
            };

            // A concurrent `remove` waits on this guard, so it cannot slip
            // between the check and the insert
            let current = self.in_flight.get(key);
            if current.as_ref().map_or(false, |c| Arc::ptr_eq(c.value(), &slot)) {
                self.put(key.clone(), value.clone());
            } else {
                log::debug!("{}: {:?} was invalidated while populating", self.name, key);
            }
            drop(current);
            *guard = Some(value.clone());
            self.in_flight.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
            drop(guard);
            return Ok(value);
        }
    }

    fn is_current_flight(&self, key: &K, slot: &InFlight<V>) -> bool {
        self.in_flight
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current.value(), slot))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            populations: self.counters.populations.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
        }
    }
}

impl<K, V> Sweep for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn cache_name(&self) -> &str {
        &self.name
    }

    fn sweep_interval(&self) -> Duration {
        self.policy.sweep_interval
    }

    fn sweep(&self) -> usize {
        self.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Barrier;
    use std::thread;

    fn policy(timeout_ms: u64) -> CachePolicy {
        CachePolicy::new(Duration::from_millis(timeout_ms), Duration::from_millis(timeout_ms / 2))
    }

    #[test]
    fn test_read_immediately_after_put() {
        let cache = ExpiringCache::new("test", policy(1_000));
        cache.put(1u32, "one");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_entry_is_never_returned() {
        let cache = ExpiringCache::new("test", policy(30).with_refresh(false));
        cache.put(1u32, "one");
        thread::sleep(Duration::from_millis(60));

        // No sweep has run; the read itself enforces expiry
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_refresh_on_access_slides_expiry() {
        let cache = ExpiringCache::new("test", policy(120));
        cache.put(1u32, 10u64);
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.get(&1), Some(10));
        }
        // 250ms have passed, well beyond the timeout, yet every read refreshed it
        assert!(cache.contains(&1));
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = ExpiringCache::new("test", CachePolicy::disabled());
        cache.put(1u32, 1u32);
        assert_eq!(cache.get(&1), None);

        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Result<u32, ()> = cache.get_or_compute(&1, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            });
            assert_eq!(value, Ok(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_purge_expired() {
        let cache = ExpiringCache::new("test", policy(30));
        cache.put(1u32, 1u32);
        cache.put(2u32, 2u32);
        thread::sleep(Duration::from_millis(60));
        cache.put(3u32, 3u32);

        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_get_or_compute_caches_success_only() {
        let cache = ExpiringCache::new("test", policy(1_000));
        let failed: Result<u32, &str> = cache.get_or_compute(&7u32, || Err("store down"));
        assert_eq!(failed, Err("store down"));
        assert!(!cache.contains(&7));

        let value: Result<u32, &str> = cache.get_or_compute(&7u32, || Ok(49));
        assert_eq!(value, Ok(49));
        let again: Result<u32, &str> = cache.get_or_compute(&7u32, || Ok(0));
        assert_eq!(again, Ok(49));
        assert_eq!(cache.stats().populations, 2);
    }

    #[test]
    fn test_single_flight_population() {
        let cache: Arc<ExpiringCache<&str, Arc<Vec<u32>>>> =
            Arc::new(ExpiringCache::new("test", policy(10_000)));
        let computations = Arc::new(AtomicUsize::new(0));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let computations = Arc::clone(&computations);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let result: Result<Arc<Vec<u32>>, ()> = cache.get_or_compute(&"chunk", || {
                        computations.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(Arc::new(vec![1, 2, 3]))
                    });
                    result.expect("population failed")
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect();
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        // Everyone observed the very same value
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_failed_flight_lets_waiter_retry() {
        let cache: Arc<ExpiringCache<u32, u32>> = Arc::new(ExpiringCache::new("test", policy(10_000)));
        let barrier = Arc::new(Barrier::new(2));

        let failing = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                cache.get_or_compute(&1u32, || {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(30));
                    Err("first attempt fails")
                })
            })
        };

        barrier.wait();
        let second: Result<u32, &str> = cache.get_or_compute(&1u32, || Ok(11));
        assert_eq!(second, Ok(11));
        assert_eq!(
            failing.join().expect("worker panicked"),
            Err("first attempt fails")
        );
        assert_eq!(cache.get(&1), Some(11));
    }

    #[test]
    fn test_racing_removal_never_leaves_stale_value() {
        let cache: Arc<ExpiringCache<u32, u64>> = Arc::new(ExpiringCache::new("test", policy(10_000)));
        let generation = Arc::new(AtomicU64::new(0));

        for _ in 0..500 {
            let writer = {
                let cache = Arc::clone(&cache);
                let generation = Arc::clone(&generation);
                thread::spawn(move || {
                    generation.fetch_add(1, Ordering::SeqCst);
                    cache.remove(&1);
                })
            };
            let read: Result<u64, ()> =
                cache.get_or_compute(&1u32, || Ok(generation.load(Ordering::SeqCst)));
            read.expect("population failed");
            writer.join().expect("writer panicked");

            if let Some(cached) = cache.get(&1) {
                assert_eq!(cached, generation.load(Ordering::SeqCst));
            }
        }
    }

    #[test]
    fn test_removal_during_population_is_not_cached() {
        let cache: Arc<ExpiringCache<u32, u32>> = Arc::new(ExpiringCache::new("test", policy(10_000)));
        let barrier = Arc::new(Barrier::new(2));

        let populating = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let result: Result<u32, ()> = cache.get_or_compute(&1u32, || {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(30));
                    Ok(1)
                });
                result
            })
        };

        barrier.wait();
        cache.remove(&1);
        assert_eq!(populating.join().expect("worker panicked"), Ok(1));
        assert!(!cache.contains(&1));
    }
}
