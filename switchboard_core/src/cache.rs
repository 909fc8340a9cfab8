//! A small LRU/TTL cache with single-flight loading, shared by the caching
//! store wrapper, the big segment wrapper, and event user deduplication.
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    written: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access order, least recently used first.
    order: VecDeque<K>,
    /// Keys with a load in flight; other readers of the same key wait on the
    /// condvar instead of issuing a second load.
    loading: HashSet<K>,
}

/// A bounded cache of loadable values.
///
/// `capacity == None` means unbounded; `ttl == None` means entries never
/// expire. Reads refresh recency; eviction removes the least recently used
/// entry. At most one load per key is in flight at a time.
pub(crate) struct LoaderCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    loaded: Condvar,
    capacity: Option<usize>,
    ttl: Option<Duration>,
}

impl<K: Eq + Hash + Clone, V: Clone> LoaderCache<K, V> {
    pub fn new(capacity: Option<usize>, ttl: Option<Duration>) -> LoaderCache<K, V> {
        LoaderCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                loading: HashSet::new(),
            }),
            loaded: Condvar::new(),
            capacity,
            ttl,
        }
    }

    /// Get a fresh entry, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        if self.entry_is_fresh(&inner, key) {
            Self::touch(&mut inner, key);
            Some(inner.entries[key].value.clone())
        } else {
            Self::forget(&mut inner, key);
            None
        }
    }

    /// Insert or replace an entry.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.lock();
        self.store(&mut inner, key, value);
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.lock();
        Self::forget(&mut inner, key);
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Get a fresh entry, or run `loader` to produce one. Concurrent callers
    /// for the same key share a single load.
    pub fn get_or_load<E>(
        &self,
        key: &K,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut inner = self.lock();
        loop {
            if self.entry_is_fresh(&inner, key) {
                Self::touch(&mut inner, key);
                return Ok(inner.entries[key].value.clone());
            }
            if inner.loading.contains(key) {
                inner = self
                    .loaded
                    .wait(inner)
                    .expect("thread holding cache lock should not panic");
                continue;
            }
            inner.loading.insert(key.clone());
            break;
        }
        drop(inner);

        let result = loader();

        let mut inner = self.lock();
        inner.loading.remove(key);
        if let Ok(value) = &result {
            self.store(&mut inner, key.clone(), value.clone());
        }
        self.loaded.notify_all();
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner
            .lock()
            .expect("thread holding cache lock should not panic")
    }

    fn entry_is_fresh(&self, inner: &Inner<K, V>, key: &K) -> bool {
        match inner.entries.get(key) {
            None => false,
            Some(entry) => match self.ttl {
                None => true,
                Some(ttl) => entry.written.elapsed() <= ttl,
            },
        }
    }

    fn store(&self, inner: &mut Inner<K, V>, key: K, value: V) {
        if inner.entries.contains_key(&key) {
            Self::touch(inner, &key);
        } else {
            inner.order.push_back(key.clone());
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                written: Instant::now(),
            },
        );
        if let Some(capacity) = self.capacity {
            while inner.entries.len() > capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
        }
    }

    fn touch(inner: &mut Inner<K, V>, key: &K) {
        if let Some(position) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(position);
            inner.order.push_back(key.clone());
        }
    }

    fn forget(inner: &mut Inner<K, V>, key: &K) {
        inner.entries.remove(key);
        if let Some(position) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(position);
        }
    }
}
