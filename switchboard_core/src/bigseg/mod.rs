//! Big segments: segments whose membership is too large to ship in the flag
//! snapshot and is instead queried per user from an external store.
mod wrapper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::eval::BigSegmentsStatus;
use crate::Result;

pub use wrapper::BigSegmentStoreWrapper;

/// Metadata reported by a big segment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// When the store was last brought up to date, in unix milliseconds.
    pub last_up_to_date: Option<u64>,
}

/// One user's big segment memberships: a map from segment reference to an
/// explicit include (`true`) or exclude (`false`). References absent from the
/// map are unknown and fall back to segment rule evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BigSegmentMembership {
    entries: HashMap<String, bool>,
}

impl BigSegmentMembership {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, bool)>) -> BigSegmentMembership {
        BigSegmentMembership {
            entries: entries.into_iter().collect(),
        }
    }

    /// Tri-state membership check for a segment reference.
    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        self.entries.get(segment_ref).copied()
    }
}

/// The external membership store contract. Implementations (Redis, DynamoDB,
/// ...) live outside the core.
pub trait BigSegmentStore: Send + Sync + 'static {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    /// Fetch the memberships of the user identified by `user_hash` (the
    /// SHA-256 of the user key, lowercase hex). `None` means the user is in
    /// no big segment.
    fn get_membership(&self, user_hash: &str) -> Result<Option<BigSegmentMembership>>;
}

/// What the evaluator needs from the big segment subsystem: a membership
/// lookup carrying the subsystem's current status.
pub trait MembershipProvider: Send + Sync {
    fn query_membership(
        &self,
        user_key: &str,
    ) -> (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus);
}

/// Health of the big segment store as observed by the background poller:
/// whether it answers at all, and whether its data is recent enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// Configuration for [`BigSegmentStoreWrapper`].
#[derive(Debug, Clone)]
pub struct BigSegmentsConfig {
    /// Bound on the per-user membership cache.
    pub user_cache_size: usize,
    /// Time-to-live of cached memberships.
    pub user_cache_time: Duration,
    /// Interval between store metadata polls.
    pub status_poll_interval: Duration,
    /// How old `last_up_to_date` may be before the store counts as stale.
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    /// Default value for [`BigSegmentsConfig::user_cache_size`].
    pub const DEFAULT_USER_CACHE_SIZE: usize = 1000;
    /// Default value for [`BigSegmentsConfig::user_cache_time`].
    pub const DEFAULT_USER_CACHE_TIME: Duration = Duration::from_secs(5);
    /// Default value for [`BigSegmentsConfig::status_poll_interval`].
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`BigSegmentsConfig::stale_after`].
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

    pub fn new() -> BigSegmentsConfig {
        BigSegmentsConfig::default()
    }

    pub fn with_user_cache_size(mut self, size: usize) -> BigSegmentsConfig {
        self.user_cache_size = size.max(1);
        self
    }

    pub fn with_user_cache_time(mut self, time: Duration) -> BigSegmentsConfig {
        self.user_cache_time = time;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> BigSegmentsConfig {
        self.status_poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> BigSegmentsConfig {
        self.stale_after = stale_after;
        self
    }
}

impl Default for BigSegmentsConfig {
    fn default() -> BigSegmentsConfig {
        BigSegmentsConfig {
            user_cache_size: BigSegmentsConfig::DEFAULT_USER_CACHE_SIZE,
            user_cache_time: BigSegmentsConfig::DEFAULT_USER_CACHE_TIME,
            status_poll_interval: BigSegmentsConfig::DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: BigSegmentsConfig::DEFAULT_STALE_AFTER,
        }
    }
}
