//! The polling update processor, used when streaming is unavailable.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::store::DataStore;
use crate::{Error, Result};

use super::{
    requester::FeatureRequester, sort_snapshot, DataSourceState, DataSourceStatusProvider,
    InitSignal, UpdateProcessor,
};

/// Configuration for [`PollingProcessor`].
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval to wait between snapshot requests.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This
    /// helps to avoid multiple server instances synchronizing and producing
    /// spiky network load.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollingConfig {
    /// Default value for [`PollingConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollingConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollingConfig {
        PollingConfig::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> PollingConfig {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollingConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingConfig {
    fn default() -> PollingConfig {
        PollingConfig {
            interval: PollingConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollingConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A polling update processor.
///
/// Periodically fetches the full snapshot through a [`FeatureRequester`] and
/// reinitializes the store with it. Unauthorized responses are fatal; any
/// other failure is retried on the next tick with previously loaded data
/// still in use.
pub struct PollingProcessor {
    join_handle: Option<std::thread::JoinHandle<()>>,
    stop_sender: SyncSender<()>,
    init: InitSignal,
}

impl PollingProcessor {
    pub fn start(
        requester: Box<dyn FeatureRequester>,
        store: Arc<dyn DataStore>,
        config: PollingConfig,
        status: Arc<DataSourceStatusProvider>,
    ) -> std::io::Result<PollingProcessor> {
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);
        let init = InitSignal::new();

        let join_handle = {
            let init = init.share();
            std::thread::Builder::new()
                .name("switchboard-poller".to_owned())
                .spawn(move || run_poller(requester, store, config, status, init, stop_receiver))?
        };

        Ok(PollingProcessor {
            join_handle: Some(join_handle),
            stop_sender,
            init,
        })
    }

    /// Stop and block waiting for the background thread to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();
        if let Some(handle) = self.join_handle.take() {
            handle.join().map_err(|_| Error::WorkerPanicked)?;
        }
        Ok(())
    }
}

impl UpdateProcessor for PollingProcessor {
    fn initialized(&self) -> bool {
        self.init.is_ok()
    }

    fn wait_for_initialization(&self, timeout: Duration) -> bool {
        matches!(self.init.wait_timeout(timeout), Some(Ok(())))
    }

    fn stop(&self) {
        let _ = self.stop_sender.try_send(());
    }
}

fn run_poller(
    mut requester: Box<dyn FeatureRequester>,
    store: Arc<dyn DataStore>,
    config: PollingConfig,
    status: Arc<DataSourceStatusProvider>,
    init: InitSignal,
    stop: Receiver<()>,
) {
    loop {
        log::debug!(target: "switchboard", "fetching flag snapshot");
        match requester.get_all() {
            Ok(snapshot) => match store.init(sort_snapshot(snapshot)) {
                Ok(()) => {
                    init.set(Ok(()));
                    status.update(DataSourceState::Valid, None);
                }
                Err(error) => {
                    log::error!(target: "switchboard", "storing snapshot failed: {error}");
                    status.update(DataSourceState::Interrupted, Some(error.to_string()));
                }
            },
            Err(error) if error.is_unrecoverable() => {
                log::error!(target: "switchboard", "polling permanently failed: {error}");
                status.update(DataSourceState::Off, Some(error.to_string()));
                init.set(Err(error));
                return;
            }
            Err(error) => {
                // Retried on the next tick.
                log::warn!(target: "switchboard", "polling request failed: {error}");
                status.update(DataSourceState::Interrupted, Some(error.to_string()));
            }
        }

        match stop.recv_timeout(jitter(config.interval, config.jitter)) {
            Err(RecvTimeoutError::Timeout) => {
                // Timed out. Loop back to fetch a new snapshot.
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "switchboard", "poller received stop command");
                status.update(DataSourceState::Off, None);
                return;
            }
        }
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
