//! Adapter between async persistent store implementations and the
//! synchronous [`PersistentDataStore`] contract.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Result;

use super::{AllData, DataKind, PersistentDataStore, StoreItem};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The asynchronous flavor of the persistent store contract, for backends
/// whose drivers are async-native.
pub trait AsyncPersistentDataStore: Send + Sync {
    fn init<'a>(&'a self, all_data: &'a AllData) -> BoxFuture<'a, Result<()>>;
    fn get<'a>(&'a self, kind: DataKind, key: &'a str) -> BoxFuture<'a, Result<Option<StoreItem>>>;
    fn all(&self, kind: DataKind) -> BoxFuture<'_, Result<HashMap<String, StoreItem>>>;
    fn upsert<'a>(
        &'a self,
        kind: DataKind,
        key: &'a str,
        item: StoreItem,
    ) -> BoxFuture<'a, Result<StoreItem>>;
    fn initialized(&self) -> BoxFuture<'_, Result<bool>>;
}

/// Presents an [`AsyncPersistentDataStore`] as a synchronous
/// [`PersistentDataStore`] by blocking the calling worker on a private
/// current-thread runtime.
///
/// Combine with [`super::CachingStoreWrapper`] so the block happens on cache
/// misses and writes, not on every evaluation.
pub struct BlockingStoreAdapter {
    inner: Arc<dyn AsyncPersistentDataStore>,
    runtime: tokio::runtime::Runtime,
}

impl BlockingStoreAdapter {
    pub fn new(inner: Arc<dyn AsyncPersistentDataStore>) -> std::io::Result<BlockingStoreAdapter> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(BlockingStoreAdapter { inner, runtime })
    }
}

impl PersistentDataStore for BlockingStoreAdapter {
    fn init(&self, all_data: &AllData) -> Result<()> {
        self.runtime.block_on(self.inner.init(all_data))
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        self.runtime.block_on(self.inner.get(kind, key))
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        self.runtime.block_on(self.inner.all(kind))
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem> {
        self.runtime.block_on(self.inner.upsert(kind, key, item))
    }

    fn initialized(&self) -> Result<bool> {
        self.runtime.block_on(self.inner.initialized())
    }
}
