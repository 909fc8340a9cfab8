//! The big segment store wrapper: per-user membership caching plus a
//! background health poller.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::broadcast::Broadcaster;
use crate::cache::LoaderCache;
use crate::eval::BigSegmentsStatus;
use crate::events::now_millis;
use crate::Result;

use super::{
    BigSegmentMembership, BigSegmentStore, BigSegmentStoreStatus, BigSegmentsConfig,
    MembershipProvider,
};

/// Wraps a [`BigSegmentStore`] in an LRU/TTL membership cache and polls its
/// metadata in the background.
///
/// Membership queries are keyed by user; concurrent queries for the same user
/// share one store fetch, and empty memberships are cached like any other.
/// The poller classifies the store as stale when its `last_up_to_date`
/// timestamp is missing or too old, and publishes every status transition to
/// subscribers.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    cache: LoaderCache<String, Option<Arc<BigSegmentMembership>>>,
    status: Arc<RwLock<BigSegmentStoreStatus>>,
    broadcaster: Arc<Broadcaster<BigSegmentStoreStatus>>,
    stop_sender: SyncSender<()>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl BigSegmentStoreWrapper {
    pub fn start(
        store: Arc<dyn BigSegmentStore>,
        config: BigSegmentsConfig,
    ) -> std::io::Result<BigSegmentStoreWrapper> {
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);
        // Until the first poll completes, the store counts as unavailable.
        let status = Arc::new(RwLock::new(BigSegmentStoreStatus {
            available: false,
            stale: false,
        }));
        let broadcaster = Arc::new(Broadcaster::new());

        let join_handle = {
            let store = Arc::clone(&store);
            let status = Arc::clone(&status);
            let broadcaster = Arc::clone(&broadcaster);
            let stale_after = config.stale_after;
            let interval = config.status_poll_interval;
            std::thread::Builder::new()
                .name("switchboard-bigseg-status".to_owned())
                .spawn(move || {
                    run_status_poller(store, status, broadcaster, stale_after, interval, stop_receiver)
                })?
        };

        Ok(BigSegmentStoreWrapper {
            store,
            cache: LoaderCache::new(Some(config.user_cache_size), Some(config.user_cache_time)),
            status,
            broadcaster,
            stop_sender,
            join_handle: Some(join_handle),
        })
    }

    /// The status as of the most recent poll.
    pub fn status(&self) -> BigSegmentStoreStatus {
        *self
            .status
            .read()
            .expect("thread holding status lock should not panic")
    }

    /// Receive a notification for every subsequent status transition.
    pub fn subscribe(&self) -> Receiver<BigSegmentStoreStatus> {
        self.broadcaster.subscribe()
    }

    /// Stop the status poller. Cached memberships remain readable.
    pub fn stop(&mut self) {
        let _ = self.stop_sender.try_send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }

    fn fetch_membership(&self, user_key: &str) -> Result<Option<Arc<BigSegmentMembership>>> {
        let hash = user_hash(user_key);
        self.store
            .get_membership(&hash)
            .map(|membership| membership.map(Arc::new))
    }
}

impl MembershipProvider for BigSegmentStoreWrapper {
    fn query_membership(
        &self,
        user_key: &str,
    ) -> (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus) {
        let membership = self
            .cache
            .get_or_load(&user_key.to_owned(), || self.fetch_membership(user_key));

        match membership {
            Err(error) => {
                log::error!(target: "switchboard",
                    "big segment membership query failed: {error}");
                (None, BigSegmentsStatus::StoreError)
            }
            Ok(membership) => {
                let status = self.status();
                let status = if !status.available {
                    BigSegmentsStatus::StoreError
                } else if status.stale {
                    BigSegmentsStatus::Stale
                } else {
                    BigSegmentsStatus::Healthy
                };
                (membership, status)
            }
        }
    }
}

impl Drop for BigSegmentStoreWrapper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// SHA-256 of the user key, lowercase hex: the form under which stores key
/// memberships.
fn user_hash(user_key: &str) -> String {
    let digest = Sha256::digest(user_key.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

fn run_status_poller(
    store: Arc<dyn BigSegmentStore>,
    status: Arc<RwLock<BigSegmentStoreStatus>>,
    broadcaster: Arc<Broadcaster<BigSegmentStoreStatus>>,
    stale_after: std::time::Duration,
    interval: std::time::Duration,
    stop: Receiver<()>,
) {
    loop {
        let polled = poll_status(&*store, stale_after);
        let changed = {
            let mut current = status
                .write()
                .expect("thread holding status lock should not panic");
            let changed = *current != polled;
            *current = polled;
            changed
        };
        if changed {
            log::info!(target: "switchboard",
                "big segment store status changed: available={} stale={}",
                polled.available, polled.stale);
            broadcaster.broadcast(polled);
        }

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn poll_status(store: &dyn BigSegmentStore, stale_after: std::time::Duration) -> BigSegmentStoreStatus {
    match store.get_metadata() {
        Err(error) => {
            log::warn!(target: "switchboard",
                "big segment store metadata query failed: {error}");
            BigSegmentStoreStatus {
                available: false,
                stale: false,
            }
        }
        Ok(metadata) => {
            let stale = match metadata.last_up_to_date {
                None => true,
                Some(last_up_to_date) => {
                    now_millis().saturating_sub(last_up_to_date) > stale_after.as_millis() as u64
                }
            };
            BigSegmentStoreStatus {
                available: true,
                stale,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::bigseg::BigSegmentStoreMetadata;
    use crate::Error;

    struct FakeBigSegmentStore {
        memberships: Mutex<Option<BigSegmentMembership>>,
        last_up_to_date: AtomicU64,
        fail_metadata: std::sync::atomic::AtomicBool,
        membership_calls: AtomicUsize,
    }

    impl FakeBigSegmentStore {
        fn fresh() -> Arc<FakeBigSegmentStore> {
            Arc::new(FakeBigSegmentStore {
                memberships: Mutex::new(Some(BigSegmentMembership::from_entries(vec![(
                    "s.g1".to_owned(),
                    true,
                )]))),
                last_up_to_date: AtomicU64::new(now_millis()),
                fail_metadata: std::sync::atomic::AtomicBool::new(false),
                membership_calls: AtomicUsize::new(0),
            })
        }
    }

    impl BigSegmentStore for FakeBigSegmentStore {
        fn get_metadata(&self) -> Result<BigSegmentStoreMetadata> {
            if self.fail_metadata.load(Ordering::SeqCst) {
                return Err(Error::BigSegmentStore("metadata unavailable".to_owned()));
            }
            Ok(BigSegmentStoreMetadata {
                last_up_to_date: Some(self.last_up_to_date.load(Ordering::SeqCst)),
            })
        }

        fn get_membership(&self, _user_hash: &str) -> Result<Option<BigSegmentMembership>> {
            self.membership_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.memberships.lock().unwrap().clone())
        }
    }

    fn config() -> BigSegmentsConfig {
        BigSegmentsConfig::new()
            .with_status_poll_interval(Duration::from_millis(10))
            .with_user_cache_time(Duration::from_secs(60))
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn membership_queries_are_cached_per_user() {
        let store = FakeBigSegmentStore::fresh();
        let wrapper = BigSegmentStoreWrapper::start(store.clone(), config()).unwrap();

        let (first, _) = wrapper.query_membership("u1");
        let (second, _) = wrapper.query_membership("u1");
        assert_eq!(first.unwrap().check("s.g1"), Some(true));
        assert!(second.is_some());
        assert_eq!(store.membership_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_evicts_least_recently_used_user() {
        let store = FakeBigSegmentStore::fresh();
        let wrapper = BigSegmentStoreWrapper::start(
            store.clone(),
            config().with_user_cache_size(2),
        )
        .unwrap();

        wrapper.query_membership("u1");
        wrapper.query_membership("u2");
        wrapper.query_membership("u3"); // evicts u1
        assert_eq!(store.membership_calls.load(Ordering::SeqCst), 3);

        wrapper.query_membership("u2");
        wrapper.query_membership("u3");
        assert_eq!(
            store.membership_calls.load(Ordering::SeqCst),
            3,
            "u2 and u3 must be served from the cache"
        );

        wrapper.query_membership("u1");
        assert_eq!(
            store.membership_calls.load(Ordering::SeqCst),
            4,
            "u1 must hit the store exactly once more"
        );
    }

    #[test]
    fn empty_memberships_are_cached_too() {
        let store = FakeBigSegmentStore::fresh();
        *store.memberships.lock().unwrap() = None;
        let wrapper = BigSegmentStoreWrapper::start(store.clone(), config()).unwrap();

        let (first, _) = wrapper.query_membership("u");
        let (second, _) = wrapper.query_membership("u");
        assert!(first.is_none());
        assert!(second.is_none());
        assert_eq!(store.membership_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_becomes_available_then_stale() {
        let store = FakeBigSegmentStore::fresh();
        let wrapper = BigSegmentStoreWrapper::start(
            store.clone(),
            config().with_stale_after(Duration::from_millis(50)),
        )
        .unwrap();

        wait_until(|| wrapper.status().available);
        let (_, status) = wrapper.query_membership("u");
        assert_eq!(status, BigSegmentsStatus::Healthy);

        // Stop refreshing the store's timestamp; it ages past stale_after.
        store
            .last_up_to_date
            .store(now_millis().saturating_sub(60_000), Ordering::SeqCst);
        wait_until(|| wrapper.status().stale);
        let (_, status) = wrapper.query_membership("u");
        assert_eq!(status, BigSegmentsStatus::Stale);
    }

    #[test]
    fn metadata_errors_make_the_store_unavailable_and_notify() {
        let store = FakeBigSegmentStore::fresh();
        let wrapper = BigSegmentStoreWrapper::start(store.clone(), config()).unwrap();
        wait_until(|| wrapper.status().available);

        let receiver = wrapper.subscribe();
        store.fail_metadata.store(true, Ordering::SeqCst);

        let update = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!update.available);

        let (_, status) = wrapper.query_membership("u");
        assert_eq!(status, BigSegmentsStatus::StoreError);
    }

    #[test]
    fn user_hash_is_lowercase_hex_sha256() {
        let hash = user_hash("userkey");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, user_hash("userkey"));
        assert_ne!(hash, user_hash("otherkey"));
    }
}
