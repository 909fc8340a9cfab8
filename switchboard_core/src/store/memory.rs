//! A thread-safe in-memory data store. This is the default store for clients
//! that do not plug in a persistent backend.
use std::collections::HashMap;
use std::sync::RwLock;

use crate::Result;

use super::{AllData, DataKind, DataStore, StoreItem};

#[derive(Default)]
struct Inner {
    items: HashMap<DataKind, HashMap<String, StoreItem>>,
    initialized: bool,
}

/// `InMemoryDataStore` provides thread-safe storage allowing concurrent reads
/// (flag evaluation) and writes (the update processor).
#[derive(Default)]
pub struct InMemoryDataStore {
    inner: RwLock<Inner>,
}

impl InMemoryDataStore {
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // Err() is possible only if the lock is poisoned (a writer panicked
        // while holding it), which should never happen.
        self.inner
            .read()
            .expect("thread holding store lock should not panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .expect("thread holding store lock should not panic")
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, all_data: AllData) -> Result<()> {
        let mut inner = self.write();
        inner.items.clear();
        for (kind, items) in all_data.data {
            inner.items.insert(kind, items.into_iter().collect());
        }
        inner.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let inner = self.read();
        inner
            .items
            .get(&kind)
            .and_then(|items| items.get(key))
            .filter(|item| !item.is_deleted())
            .cloned()
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let inner = self.read();
        inner
            .items
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, item)| !item.is_deleted())
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem> {
        let mut inner = self.write();
        let items = inner.items.entry(kind).or_default();
        match items.get(key) {
            Some(current) if current.version() >= item.version() => Ok(current.clone()),
            _ => {
                items.insert(key.to_owned(), item.clone());
                Ok(item)
            }
        }
    }

    fn initialized(&self) -> bool {
        self.read().initialized
    }
}
