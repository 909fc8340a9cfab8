//! Data sources that keep the store synchronized with the control plane:
//! a streaming processor (preferred) and a polling processor (fallback).
mod ordering;
mod polling;
mod requester;
mod streaming;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::broadcast::Broadcaster;
use crate::flagdata::{FeatureFlag, Segment};
use crate::{Error, Result};

pub use ordering::sort_snapshot;
pub use polling::{PollingConfig, PollingProcessor};
pub use requester::{FeatureRequester, ReqwestFeatureRequester, DEFAULT_POLLING_BASE_URI};
pub use streaming::{
    StreamConnection, StreamMessage, StreamSource, StreamingConfig, StreamingProcessor,
    DEFAULT_STREAMING_URI,
};

/// A full data snapshot as it appears on the wire (`put` payloads and poll
/// responses), before initialization ordering is applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotData {
    #[serde(default)]
    pub flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

/// The common surface of streaming and polling processors, as seen by the
/// client facade.
pub trait UpdateProcessor: Send + Sync {
    /// True once the processor has successfully initialized the store.
    fn initialized(&self) -> bool;

    /// Block up to `timeout` for the first successful init. Returns `false`
    /// on timeout or permanent failure.
    fn wait_for_initialization(&self, timeout: Duration) -> bool;

    /// Ask the background task to stop. Does not block.
    fn stop(&self);
}

/// Update processor used in offline mode: nothing to synchronize, always
/// "initialized".
pub struct NullUpdateProcessor;

impl UpdateProcessor for NullUpdateProcessor {
    fn initialized(&self) -> bool {
        true
    }
    fn wait_for_initialization(&self, _timeout: Duration) -> bool {
        true
    }
    fn stop(&self) {}
}

/// Lifecycle state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    /// Starting up; the first init has not happened yet.
    Initializing,
    /// Connected and delivering updates.
    Valid,
    /// Temporarily disconnected; previously loaded data remains in use.
    Interrupted,
    /// Permanently stopped (invalid SDK key or explicit shutdown).
    Off,
}

/// Current state of a data source plus the most recent error, published to
/// subscribers on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub last_error: Option<String>,
}

/// Tracks and publishes [`DataSourceStatus`] transitions.
pub struct DataSourceStatusProvider {
    current: Mutex<DataSourceStatus>,
    broadcaster: Broadcaster<DataSourceStatus>,
}

impl DataSourceStatusProvider {
    pub fn new() -> DataSourceStatusProvider {
        DataSourceStatusProvider {
            current: Mutex::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                last_error: None,
            }),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.lock().clone()
    }

    /// Receive a notification for every subsequent state transition.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<DataSourceStatus> {
        self.broadcaster.subscribe()
    }

    pub(crate) fn update(&self, state: DataSourceState, error: Option<String>) {
        let mut current = self.lock();
        if error.is_some() {
            current.last_error = error;
        }
        if current.state != state {
            current.state = state;
            let status = current.clone();
            drop(current);
            self.broadcaster.broadcast(status);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DataSourceStatus> {
        self.current
            .lock()
            .expect("thread holding status lock should not panic")
    }
}

impl Default for DataSourceStatusProvider {
    fn default() -> DataSourceStatusProvider {
        DataSourceStatusProvider::new()
    }
}

/// One-shot initialization signal shared between a processor's background
/// thread and callers blocking on startup.
///
/// Holds `None` until the first init attempt resolves, then `Some(Ok(()))` or
/// `Some(Err(..))` for a permanent failure.
pub(crate) struct InitSignal {
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl InitSignal {
    pub fn new() -> InitSignal {
        InitSignal {
            result: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub fn share(&self) -> InitSignal {
        InitSignal {
            result: Arc::clone(&self.result),
        }
    }

    /// Record the outcome of the first init. Later calls are ignored.
    pub fn set(&self, value: Result<()>) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.result.1.notify_all();
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(&*self.lock(), Some(Ok(())))
    }

    /// Wait up to `timeout` for the signal. `None` means it is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let guard = self.lock();
        let (guard, _timed_out) = self
            .result
            .1
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .expect("thread holding init signal lock should not panic");
        guard.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Result<()>>> {
        self.result
            .0
            .lock()
            .expect("thread holding init signal lock should not panic")
    }
}

/// Parse a stream update path like `/flags/KEY` or `/segments/KEY`.
pub(crate) fn parse_update_path(path: &str) -> Option<(crate::store::DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((crate::store::DataKind::Features, key))
    } else {
        path.strip_prefix("/segments/")
            .map(|key| (crate::store::DataKind::Segments, key))
    }
}

/// Parse a `patch`/`delete` data item into a store item for the kind named by
/// its path.
pub(crate) fn parse_item(
    kind: crate::store::DataKind,
    data: serde_json::Value,
) -> Result<crate::store::StoreItem> {
    let item = match kind {
        crate::store::DataKind::Features => serde_json::from_value::<FeatureFlag>(data)
            .map(crate::store::StoreItem::Flag),
        crate::store::DataKind::Segments => {
            serde_json::from_value::<Segment>(data).map(crate::store::StoreItem::Segment)
        }
    };
    item.map_err(|err| Error::MalformedPayload(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DataKind;

    #[test]
    fn update_paths_resolve_to_kinds() {
        assert_eq!(
            parse_update_path("/flags/my-flag"),
            Some((DataKind::Features, "my-flag"))
        );
        assert_eq!(
            parse_update_path("/segments/my-segment"),
            Some((DataKind::Segments, "my-segment"))
        );
        assert_eq!(parse_update_path("/other/thing"), None);
    }

    #[test]
    fn init_signal_is_first_write_wins() {
        let signal = InitSignal::new();
        assert!(signal.wait_timeout(Duration::from_millis(5)).is_none());

        signal.set(Ok(()));
        signal.set(Err(Error::Unauthorized));
        assert!(signal.is_ok());
        assert!(matches!(
            signal.wait_timeout(Duration::from_millis(5)),
            Some(Ok(()))
        ));
    }

    #[test]
    fn status_provider_publishes_transitions_only() {
        let provider = DataSourceStatusProvider::new();
        let receiver = provider.subscribe();

        provider.update(DataSourceState::Initializing, None);
        provider.update(DataSourceState::Valid, None);
        provider.update(DataSourceState::Valid, None);
        provider.update(DataSourceState::Interrupted, Some("boom".to_owned()));

        let first = receiver.recv().unwrap();
        assert_eq!(first.state, DataSourceState::Valid);
        let second = receiver.recv().unwrap();
        assert_eq!(second.state, DataSourceState::Interrupted);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert!(receiver.try_recv().is_err());
    }
}
