//! A bounded least-recently-used cache with optional time-to-live, used to deduplicate analytics
//! events.
use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Source of the current time. Exists so that expiration can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Fixed-capacity cache with least-recently-used eviction and optional time-to-live.
///
/// Expiration is lazy: expired entries are dropped when they are accessed (or evicted by
/// capacity); there is no background sweep.
pub struct Cache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency index. The smallest tick is the least recently used entry.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
}

struct Entry<V> {
    value: V,
    touched_at: Instant,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    /// Create a cache holding at most `capacity` entries. If `ttl` is set, entries older than
    /// `ttl` (since they were last set) are treated as absent.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Cache<K, V> {
        Cache::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Cache<K, V> {
        Cache {
            capacity,
            ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
        }
    }

    /// Get the value for `key`, marking it as most recently used.
    ///
    /// Returns `None` if the key was never set, has been evicted, or has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if !inner.is_live(key, now, self.ttl) {
            return None;
        }
        inner.promote(key).cloned()
    }

    /// Insert or overwrite `key`, refreshing both its recency and timestamp. Evicts the least
    /// recently used entry if the cache is over capacity afterwards.
    pub fn set(&self, key: K, value: V) {
        let now = self.clock.now();
        self.lock().insert(key, value, now, self.capacity);
    }

    /// Insert `key` unless it already holds an unexpired entry, as one atomic step. Returns
    /// `true` if the value was inserted.
    ///
    /// A live entry is marked as most recently used but keeps its value and timestamp.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.is_live(&key, now, self.ttl) {
            inner.promote(&key);
            return false;
        }
        inner.insert(key, value, now, self.capacity);
        true
    }

    pub fn remove(&self, key: &K) {
        self.lock().remove(key);
    }

    /// Number of entries currently held, including expired entries that were not accessed yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // Cache operations never panic while holding the lock, so poisoning is not expected. If it
        // happens anyway, the index is still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    /// Whether `key` holds an unexpired entry. Expired entries are dropped.
    fn is_live(&mut self, key: &K, now: Instant, ttl: Option<Duration>) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        let expired = ttl.is_some_and(|ttl| now.saturating_duration_since(entry.touched_at) > ttl);
        if expired {
            self.remove(key);
        }
        !expired
    }

    fn promote(&mut self, key: &K) -> Option<&V> {
        let tick = self.bump_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, key.clone());
        entry.tick = tick;
        Some(&entry.value)
    }

    fn insert(&mut self, key: K, value: V, now: Instant, capacity: usize) {
        let tick = self.bump_tick();
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                value,
                touched_at: now,
                tick,
            },
        );
        if let Some(previous) = previous {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > capacity {
            let Some((_, lru_key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&lru_key);
        }
    }
}
