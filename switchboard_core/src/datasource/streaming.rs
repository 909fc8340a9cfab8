//! The streaming update processor.
//!
//! The SSE transport itself is pluggable: anything that can produce `put`,
//! `patch`, and `delete` messages over a long-lived connection can drive this
//! processor. The processor owns reconnection (exponential backoff with full
//! jitter), payload handling, and initialization signalling.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::Deserialize;

use crate::store::{DataStore, StoreItem};
use crate::{Error, Result};

use super::{
    parse_item, parse_update_path, sort_snapshot, DataSourceState, DataSourceStatusProvider,
    InitSignal, SnapshotData, UpdateProcessor,
};

/// Default URI of the streaming endpoint.
pub const DEFAULT_STREAMING_URI: &str = "https://stream.launchdarkly.com/all";

/// One server-sent event: the event name and its raw JSON data.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub event: String,
    pub data: String,
}

/// An established streaming connection.
pub trait StreamConnection: Send {
    /// Block until the next message arrives. An error means the connection
    /// was lost and the processor will reconnect with backoff.
    fn next_message(&mut self) -> Result<StreamMessage>;
}

/// A factory for streaming connections. The concrete SSE transport lives
/// outside the core; tests substitute scripted sources.
pub trait StreamSource: Send + 'static {
    fn connect(&mut self) -> Result<Box<dyn StreamConnection>>;
}

/// Configuration for [`StreamingProcessor`].
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Base reconnection delay; doubles per failed attempt.
    ///
    /// Defaults to [`StreamingConfig::DEFAULT_INITIAL_RECONNECT_DELAY`].
    pub initial_reconnect_delay: Duration,
    /// Ceiling on the reconnection delay.
    ///
    /// Defaults to [`StreamingConfig::DEFAULT_MAX_RECONNECT_DELAY`].
    pub max_reconnect_delay: Duration,
}

impl StreamingConfig {
    /// Default value for [`StreamingConfig::initial_reconnect_delay`].
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`StreamingConfig::max_reconnect_delay`].
    pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

    pub fn new() -> StreamingConfig {
        StreamingConfig::default()
    }

    pub fn with_initial_reconnect_delay(mut self, delay: Duration) -> StreamingConfig {
        self.initial_reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> StreamingConfig {
        self.max_reconnect_delay = delay;
        self
    }
}

impl Default for StreamingConfig {
    fn default() -> StreamingConfig {
        StreamingConfig {
            initial_reconnect_delay: StreamingConfig::DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: StreamingConfig::DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PutPayload {
    data: SnapshotData,
}

#[derive(Debug, Deserialize)]
struct PatchPayload {
    path: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeletePayload {
    path: String,
    version: u64,
}

/// A streaming update processor.
///
/// Owns a background thread that connects through the [`StreamSource`],
/// applies `put`/`patch`/`delete` messages to the store, and reconnects with
/// jittered exponential backoff when the connection drops. The "initialized"
/// signal fires exactly once, the first time a `put` lands successfully.
pub struct StreamingProcessor {
    join_handle: Option<std::thread::JoinHandle<()>>,
    stop_sender: SyncSender<()>,
    init: InitSignal,
}

impl StreamingProcessor {
    pub fn start(
        source: Box<dyn StreamSource>,
        store: Arc<dyn DataStore>,
        config: StreamingConfig,
        status: Arc<DataSourceStatusProvider>,
    ) -> std::io::Result<StreamingProcessor> {
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);
        let init = InitSignal::new();

        let join_handle = {
            let init = init.share();
            std::thread::Builder::new()
                .name("switchboard-stream".to_owned())
                .spawn(move || {
                    run_stream(source, store, config, status, init, stop_receiver);
                })?
        };

        Ok(StreamingProcessor {
            join_handle: Some(join_handle),
            stop_sender,
            init,
        })
    }

    /// Stop and block waiting for the background thread to exit. Only safe to
    /// call when the source's blocking reads can terminate.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();
        if let Some(handle) = self.join_handle.take() {
            handle.join().map_err(|_| Error::WorkerPanicked)?;
        }
        Ok(())
    }
}

impl UpdateProcessor for StreamingProcessor {
    fn initialized(&self) -> bool {
        self.init.is_ok()
    }

    fn wait_for_initialization(&self, timeout: Duration) -> bool {
        matches!(self.init.wait_timeout(timeout), Some(Ok(())))
    }

    fn stop(&self) {
        // Full buffer or a disconnected receiver both mean the thread is
        // already stopping; nothing useful to do either way.
        let _ = self.stop_sender.try_send(());
    }
}

fn run_stream(
    mut source: Box<dyn StreamSource>,
    store: Arc<dyn DataStore>,
    config: StreamingConfig,
    status: Arc<DataSourceStatusProvider>,
    init: InitSignal,
    stop: Receiver<()>,
) {
    let mut delay = config.initial_reconnect_delay;

    loop {
        if stop.try_recv().is_ok() {
            status.update(DataSourceState::Off, None);
            return;
        }

        let mut connection = match source.connect() {
            Ok(connection) => connection,
            Err(error) if error.is_unrecoverable() => {
                log::error!(target: "switchboard",
                    "stream connection permanently failed: {error}");
                status.update(DataSourceState::Off, Some(error.to_string()));
                init.set(Err(error));
                return;
            }
            Err(error) => {
                log::warn!(target: "switchboard", "stream connection failed: {error}");
                status.update(DataSourceState::Interrupted, Some(error.to_string()));
                if !backoff_sleep(&stop, delay) {
                    status.update(DataSourceState::Off, None);
                    return;
                }
                delay = (delay * 2).min(config.max_reconnect_delay);
                continue;
            }
        };

        loop {
            if stop.try_recv().is_ok() {
                status.update(DataSourceState::Off, None);
                return;
            }
            match connection.next_message() {
                Ok(message) => match handle_message(&*store, &init, &message) {
                    Ok(()) => {
                        status.update(DataSourceState::Valid, None);
                        // The connection delivered an event; reset backoff.
                        delay = config.initial_reconnect_delay;
                    }
                    Err(error) => {
                        log::warn!(target: "switchboard",
                            "dropping stream connection after malformed '{}' payload: {error}",
                            message.event);
                        status.update(DataSourceState::Interrupted, Some(error.to_string()));
                        break;
                    }
                },
                Err(error) if error.is_unrecoverable() => {
                    log::error!(target: "switchboard",
                        "stream permanently failed: {error}");
                    status.update(DataSourceState::Off, Some(error.to_string()));
                    init.set(Err(error));
                    return;
                }
                Err(error) => {
                    log::warn!(target: "switchboard", "stream interrupted: {error}");
                    status.update(DataSourceState::Interrupted, Some(error.to_string()));
                    break;
                }
            }
        }

        if !backoff_sleep(&stop, delay) {
            status.update(DataSourceState::Off, None);
            return;
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }
}

fn handle_message(store: &dyn DataStore, init: &InitSignal, message: &StreamMessage) -> Result<()> {
    match message.event.as_str() {
        "put" => {
            let payload: PutPayload = serde_json::from_str(&message.data)
                .map_err(|err| Error::MalformedPayload(err.to_string()))?;
            store.init(sort_snapshot(payload.data))?;
            init.set(Ok(()));
            log::info!(target: "switchboard", "received full data snapshot");
            Ok(())
        }
        "patch" => {
            let payload: PatchPayload = serde_json::from_str(&message.data)
                .map_err(|err| Error::MalformedPayload(err.to_string()))?;
            let Some((kind, key)) = parse_update_path(&payload.path) else {
                return Err(Error::MalformedPayload(format!(
                    "unrecognized patch path '{}'",
                    payload.path
                )));
            };
            let item = parse_item(kind, payload.data)?;
            store.upsert(kind, key, item)?;
            Ok(())
        }
        "delete" => {
            let payload: DeletePayload = serde_json::from_str(&message.data)
                .map_err(|err| Error::MalformedPayload(err.to_string()))?;
            let Some((kind, key)) = parse_update_path(&payload.path) else {
                return Err(Error::MalformedPayload(format!(
                    "unrecognized delete path '{}'",
                    payload.path
                )));
            };
            store.upsert(kind, key, StoreItem::Tombstone(payload.version))?;
            Ok(())
        }
        other => {
            log::warn!(target: "switchboard", "ignoring unknown stream event '{other}'");
            Ok(())
        }
    }
}

/// Sleep for a jittered delay, waking early on a stop command. Returns `false`
/// when the processor should exit.
fn backoff_sleep(stop: &Receiver<()>, delay: Duration) -> bool {
    // Full jitter: sleep a uniformly random duration in [0, delay].
    let jittered = if delay.is_zero() {
        delay
    } else {
        thread_rng().gen_range(Duration::ZERO..=delay)
    };
    match stop.recv_timeout(jittered) {
        Err(RecvTimeoutError::Timeout) => true,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
    }
}
