//! Versioned storage for flag and segment definitions.
//!
//! A store holds two kinds of items (features and segments), each visible
//! only at the highest version ever written. Deletions are tombstones: they
//! occupy a version slot so that late-arriving older writes cannot resurrect
//! an item, and reads filter them to `None`.
mod async_adapter;
mod caching;
mod memory;

use std::collections::HashMap;

use derive_more::From;

use crate::eval::EvaluationStore;
use crate::flagdata::{FeatureFlag, Segment};
use crate::Result;

pub use async_adapter::{AsyncPersistentDataStore, BlockingStoreAdapter};
pub use caching::{CacheConfig, CachingStoreWrapper};
pub use memory::InMemoryDataStore;

/// The two namespaces a store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

/// A versioned item (or deletion tombstone) as stored.
#[derive(Debug, Clone, PartialEq, From)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
    /// A deleted item's placeholder, carrying only the deletion version.
    #[from(ignore)]
    Tombstone(u64),
}

impl StoreItem {
    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(flag) => flag.version,
            StoreItem::Segment(segment) => segment.version,
            StoreItem::Tombstone(version) => *version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            StoreItem::Flag(flag) => flag.deleted,
            StoreItem::Segment(segment) => segment.deleted,
            StoreItem::Tombstone(_) => true,
        }
    }
}

/// A complete data set, ordered for initialization: segments precede
/// features, and prerequisite flags precede their dependents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllData {
    pub data: Vec<(DataKind, Vec<(String, StoreItem)>)>,
}

/// The logical data store consulted by the evaluator and written by update
/// processors.
///
/// Reads filter tombstones to `None`; `upsert` refuses any write whose
/// version is not strictly greater than the current one, which makes updates
/// idempotent and commutative under version.
pub trait DataStore: Send + Sync {
    /// Atomically replace the entire contents. The first successful call
    /// flips `initialized` permanently.
    fn init(&self, all_data: AllData) -> Result<()>;

    /// Current visible item, or `None` if absent or deleted.
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;

    /// All current visible items of a kind, tombstones filtered out.
    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem>;

    /// Write an item (or tombstone) if its version is newer than what is
    /// stored. Returns the item now in the store, which is the existing one
    /// when the write was refused.
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem>;

    /// True once an init has succeeded.
    fn initialized(&self) -> bool;
}

impl<T: DataStore + ?Sized> DataStore for std::sync::Arc<T> {
    fn init(&self, all_data: AllData) -> Result<()> {
        (**self).init(all_data)
    }
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        (**self).get(kind, key)
    }
    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        (**self).all(kind)
    }
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem> {
        (**self).upsert(kind, key, item)
    }
    fn initialized(&self) -> bool {
        (**self).initialized()
    }
}

impl<T: DataStore + ?Sized> EvaluationStore for T {
    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        match self.get(DataKind::Features, key) {
            Some(StoreItem::Flag(flag)) => Some(flag),
            _ => None,
        }
    }

    fn segment(&self, key: &str) -> Option<Segment> {
        match self.get(DataKind::Segments, key) {
            Some(StoreItem::Segment(segment)) => Some(segment),
            _ => None,
        }
    }
}

/// The contract for pluggable persistent backends (Redis, DynamoDB, ...).
///
/// Unlike [`DataStore`], a backend surfaces tombstones to its caller (the
/// caching wrapper needs them for negative caching) and every operation may
/// fail.
pub trait PersistentDataStore: Send + Sync {
    fn init(&self, all_data: &AllData) -> Result<()>;
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;
    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<StoreItem>;
    fn initialized(&self) -> Result<bool>;
}
