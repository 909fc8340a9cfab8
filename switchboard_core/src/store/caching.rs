//! A write-through caching wrapper for remote store backends.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::LoaderCache;
use crate::{Error, Result};

use super::{AllData, DataKind, DataStore, PersistentDataStore, StoreItem};

/// Caching behavior for [`CachingStoreWrapper`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub(crate) enabled: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) capacity: Option<usize>,
}

impl CacheConfig {
    /// Default value for [`CacheConfig::with_ttl`].
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

    /// Caching with the default TTL and no capacity bound.
    pub fn new() -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl: Some(CacheConfig::DEFAULT_TTL),
            capacity: None,
        }
    }

    /// No caching: every read reaches the backend.
    pub fn disabled() -> CacheConfig {
        CacheConfig {
            enabled: false,
            ttl: None,
            capacity: None,
        }
    }

    /// Entry time-to-live. `None` keeps entries forever.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> CacheConfig {
        self.ttl = ttl;
        self
    }

    /// Bound on the number of cached items per cache.
    pub fn with_capacity(mut self, capacity: Option<usize>) -> CacheConfig {
        self.capacity = capacity;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig::new()
    }
}

struct Caches {
    /// Memoized per (kind, key); `None` entries are cached misses.
    items: LoaderCache<(DataKind, String), Option<StoreItem>>,
    /// Memoized per kind.
    all: LoaderCache<DataKind, HashMap<String, StoreItem>>,
}

/// Wraps a [`PersistentDataStore`] backend in read-through/write-through
/// caching, presenting the plain [`DataStore`] interface to the rest of the
/// SDK.
///
/// Negative results are cached like positive ones; `upsert` updates the item
/// cache with the post-write value returned by the backend and invalidates
/// the per-kind `all` cache; the initialized flag is sticky once observed
/// true.
pub struct CachingStoreWrapper {
    backend: Arc<dyn PersistentDataStore>,
    caches: Option<Caches>,
    initialized: AtomicBool,
}

impl CachingStoreWrapper {
    pub fn new(backend: Arc<dyn PersistentDataStore>, config: CacheConfig) -> CachingStoreWrapper {
        let caches = config.enabled.then(|| Caches {
            items: LoaderCache::new(config.capacity, config.ttl),
            all: LoaderCache::new(config.capacity, config.ttl),
        });
        CachingStoreWrapper {
            backend,
            caches,
            initialized: AtomicBool::new(false),
        }
    }

    fn load_item(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        Ok(self.backend.get(kind, key)?.filter(|item| !item.is_deleted()))
    }

    fn load_all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        let mut items = self.backend.all(kind)?;
        items.retain(|_, item| !item.is_deleted());
        Ok(items)
    }
}

fn log_store_error(operation: &str, error: &Error) {
    log::error!(target: "switchboard", "data store {} failed: {}", operation, error);
}

impl DataStore for CachingStoreWrapper {
    fn init(&self, all_data: AllData) -> Result<()> {
        self.backend.init(&all_data)?;

        if let Some(caches) = &self.caches {
            caches.items.clear();
            caches.all.clear();
            for (kind, items) in &all_data.data {
                let visible: HashMap<String, StoreItem> = items
                    .iter()
                    .filter(|(_, item)| !item.is_deleted())
                    .cloned()
                    .collect();
                for (key, item) in items {
                    let cached = (!item.is_deleted()).then(|| item.clone());
                    caches.items.insert((*kind, key.clone()), cached);
                }
                caches.all.insert(*kind, visible);
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let result = match &self.caches {
            None => self.load_item(kind, key),
            Some(caches) => caches
                .items
                .get_or_load(&(kind, key.to_owned()), || self.load_item(kind, key)),
        };
        match result {
            Ok(item) => item,
            Err(error) => {
                log_store_error("get", &error);
                None
            }
        }
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let result = match &self.caches {
            None => self.load_all(kind),
            Some(caches) => caches.all.get_or_load(&kind, || self.load_all(kind)),
        };
        match result {
            Ok(items) => items,
            Err(error) => {
                log_store_error("all", &error);
                HashMap::new()
            }
        }
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem> {
        let stored = self.backend.upsert(kind, key, item)?;
        if let Some(caches) = &self.caches {
            let cached = (!stored.is_deleted()).then(|| stored.clone());
            caches.items.insert((kind, key.to_owned()), cached);
            caches.all.remove(&kind);
        }
        Ok(stored)
    }

    fn initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        match self.backend.initialized() {
            Ok(true) => {
                self.initialized.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(error) => {
                log_store_error("initialized", &error);
                false
            }
        }
    }
}
