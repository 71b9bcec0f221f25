//! In-process TTL caches with a shared periodic sweeper.
//!
//! Each cache registers itself in a process-wide list; a single
//! sweeper task walks that list on an interval and drops entries
//! whose expiration has passed. Lookups also drop expired entries
//! eagerly, so the sweeper is only there to bound memory between
//! lookups.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};

static CACHES: LazyLock<Mutex<Vec<Weak<dyn Sweepable + Send + Sync>>>> =
    LazyLock::new(Mutex::default);

trait Sweepable {
    fn name(&self) -> &str;
    fn sweep(&self) -> usize;
}

/// Sweep every registered cache once, returning the total number
/// of entries removed. Dead registrations are pruned as we go.
pub fn sweep_all_caches() -> usize {
    let mut caches = vec![];
    CACHES.lock().retain(|entry| match entry.upgrade() {
        Some(cache) => {
            caches.push(cache);
            true
        }
        None => false,
    });

    let mut total = 0;
    for cache in caches {
        let removed = cache.sweep();
        if removed > 0 {
            tracing::debug!("swept {removed} expired entries from cache {}", cache.name());
        }
        total += removed;
    }
    total
}

/// Spawn the background sweeper. Call once from the daemon after the
/// runtime is up.
pub fn start_sweeper(interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_all_caches();
        }
    });
}

struct Entry<V> {
    item: V,
    expires: Instant,
}

struct Inner<K: Hash + Eq, V: Clone> {
    name: String,
    map: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Hash + Eq, V: Clone> Sweepable for Inner<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn sweep(&self) -> usize {
        let mut map = self.map.lock();
        let before = map.len();
        let now = Instant::now();
        map.retain(|_, entry| entry.expires > now);
        before - map.len()
    }
}

/// A keyed cache where every entry carries its own expiration.
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Arc<Inner<K, V>>,
}

impl<K: Hash + Eq + Send + 'static, V: Clone + Send + 'static> TtlCache<K, V> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            map: Mutex::new(HashMap::new()),
        });

        // Register with the sweeper list. The K/V types need to be
        // erased for that, hence the Sweepable trait object.
        let generic: Arc<dyn Sweepable + Send + Sync> = inner.clone();
        CACHES.lock().push(Arc::downgrade(&generic));

        Self { inner }
    }

    pub fn get<Q: ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut map = self.inner.map.lock();
        match map.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.item.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, item: V, ttl: Duration) {
        self.inner.map.lock().insert(
            key,
            Entry {
                item,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Fetch an existing live entry, or insert the value produced by
    /// `func`. Atomic with respect to other callers of this cache.
    pub fn get_or_insert<F: FnOnce() -> V>(&self, key: K, ttl: Duration, func: F) -> V {
        let mut map = self.inner.map.lock();
        if let Some(entry) = map.get(&key) {
            if entry.expires > Instant::now() {
                return entry.item.clone();
            }
        }
        let item = func();
        map.insert(
            key,
            Entry {
                item: item.clone(),
                expires: Instant::now() + ttl,
            },
        );
        item
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.map.lock().clear();
    }
}
