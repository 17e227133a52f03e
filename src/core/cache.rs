/// Bounded, time-expiring, refresh-ahead memo cache with single-flight loads.
///
/// Each key owns a slot guarded by its own mutex, so the first caller for an
/// uncached key computes while every concurrent caller for that key waits and
/// then shares the same value. Entries older than `refresh_after` are still
/// served, and exactly one caller recomputes them in the meantime; entries
/// older than `ttl` are recomputed before being served.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub capacity: usize,
    pub ttl: Duration,
    pub refresh_after: Duration,
}

struct Entry<V> {
    value: V,
    loaded_at: Instant,
}

struct Slot<V> {
    entry: Mutex<Option<Entry<V>>>,
    refreshing: AtomicBool,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            entry: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }
}

/// Clears a slot's refresh flag however the refreshing load ends.
struct RefreshGuard<'s> {
    flag: &'s AtomicBool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Tracked<V> {
    slot: Arc<Slot<V>>,
    last_access: Instant,
}

pub struct TtlCache<K, V> {
    policy: CachePolicy,
    slots: Mutex<HashMap<K, Tracked<V>>>,
}

/// A poisoned lock only means another loader panicked; the map itself is
/// still consistent, so keep using it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate(&self, key: &K) {
        lock(&self.slots).remove(key);
    }

    /// Get the value for `key`, computing it with `load` when missing or expired.
    pub fn get_or_load<F>(&self, key: &K, load: F) -> V
    where
        F: FnOnce() -> V,
    {
        let slot = self.slot_for(key);
        let mut guard = lock(&slot.entry);
        let now = Instant::now();

        if let Some(entry) = guard.as_ref() {
            let age = now.saturating_duration_since(entry.loaded_at);
            if age < self.policy.refresh_after {
                return entry.value.clone();
            }
            if age < self.policy.ttl {
                let stale = entry.value.clone();
                if slot.refreshing.swap(true, Ordering::AcqRel) {
                    // someone else is already refreshing this key
                    return stale;
                }
                let _refresh = RefreshGuard {
                    flag: &slot.refreshing,
                };
                drop(guard);
                let fresh = load();
                let mut guard = lock(&slot.entry);
                *guard = Some(Entry {
                    value: fresh.clone(),
                    loaded_at: Instant::now(),
                });
                return fresh;
            }
        }

        // Missing or expired: load while holding the slot lock so concurrent
        // callers for this key wait for this one result.
        let value = load();
        *guard = Some(Entry {
            value: value.clone(),
            loaded_at: Instant::now(),
        });
        value
    }

    fn slot_for(&self, key: &K) -> Arc<Slot<V>> {
        let mut slots = lock(&self.slots);
        let now = Instant::now();
        if let Some(tracked) = slots.get_mut(key) {
            tracked.last_access = now;
            return Arc::clone(&tracked.slot);
        }
        if slots.len() >= self.policy.capacity.max(1) {
            // a slot still held by a caller may be mid-load; evicting it
            // would let the next caller start a second load
            let oldest = slots
                .iter()
                .filter(|(_, t)| Arc::strong_count(&t.slot) == 1)
                .min_by_key(|(_, t)| t.last_access)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                slots.remove(&oldest);
            }
        }
        let slot = Arc::new(Slot::new());
        slots.insert(
            key.clone(),
            Tracked {
                slot: Arc::clone(&slot),
                last_access: now,
            },
        );
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn policy(capacity: usize, ttl_ms: u64, refresh_ms: u64) -> CachePolicy {
        CachePolicy {
            capacity,
            ttl: Duration::from_millis(ttl_ms),
            refresh_after: Duration::from_millis(refresh_ms),
        }
    }

    #[test]
    fn loads_once_per_key() {
        let cache = TtlCache::new(policy(8, 60_000, 60_000));
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache.get_or_load(&"a", || {
                loads.fetch_add(1, Ordering::SeqCst);
                7
            });
            assert_eq!(v, 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_access_is_single_flight() {
        let cache = TtlCache::new(policy(8, 60_000, 60_000));
        let loads = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let v = cache.get_or_load(&1u32, || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Arc::new(vec![1, 2, 3])
                    });
                    assert_eq!(*v, vec![1, 2, 3]);
                });
            }
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_entries_reload() {
        let cache = TtlCache::new(policy(8, 0, 0));
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            cache.get_or_load(&"a", || loads.fetch_add(1, Ordering::SeqCst));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn refresh_ahead_recomputes_stale_value() {
        let cache = TtlCache::new(policy(8, 60_000, 0));
        assert_eq!(cache.get_or_load(&"a", || 1), 1);
        // stale but within ttl: the refreshing caller gets the new value
        assert_eq!(cache.get_or_load(&"a", || 2), 2);
        assert_eq!(cache.get_or_load(&"a", || 3), 3);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = TtlCache::new(policy(2, 60_000, 60_000));
        cache.get_or_load(&"a", || 1);
        thread::sleep(Duration::from_millis(2));
        cache.get_or_load(&"b", || 2);
        thread::sleep(Duration::from_millis(2));
        cache.get_or_load(&"a", || 10);
        thread::sleep(Duration::from_millis(2));
        cache.get_or_load(&"c", || 3);
        assert_eq!(cache.len(), 2);
        // "b" was evicted, "a" survived
        assert_eq!(cache.get_or_load(&"a", || 100), 1);
        assert_eq!(cache.get_or_load(&"b", || 20), 20);
    }

    #[test]
    fn eviction_spares_a_key_that_is_loading() {
        let cache = TtlCache::new(policy(1, 60_000, 60_000));
        let loads = AtomicUsize::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                cache.get_or_load(&"a", || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    1
                })
            });
            thread::sleep(Duration::from_millis(20));
            // over capacity, but "a" is in flight and must stay
            assert_eq!(cache.get_or_load(&"b", || 2), 2);
            let a = cache.get_or_load(&"a", || {
                loads.fetch_add(1, Ordering::SeqCst);
                10
            });
            assert_eq!(a, 1);
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_refresh_does_not_block_later_refreshes() {
        let cache = TtlCache::new(policy(4, 60_000, 0));
        assert_eq!(cache.get_or_load(&"a", || 1), 1);
        let refresh = panic::catch_unwind(AssertUnwindSafe(|| {
            cache.get_or_load(&"a", || -> i32 { panic!("load failed") })
        }));
        assert!(refresh.is_err());
        // the stale value is still there and the next caller refreshes it
        assert_eq!(cache.get_or_load(&"a", || 3), 3);
    }

    #[test]
    fn invalidate_forces_reload() {
        let cache = TtlCache::new(policy(4, 60_000, 60_000));
        cache.get_or_load(&"a", || 1);
        cache.invalidate(&"a");
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_load(&"a", || 2), 2);
    }
}
