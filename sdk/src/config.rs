use std::sync::Arc;
use std::time::Duration;

use switchboard_core::bigseg::{BigSegmentStore, BigSegmentsConfig};
use switchboard_core::datasource::{
    FeatureRequester, PollingConfig, StreamSource, StreamingConfig, DEFAULT_POLLING_BASE_URI,
    DEFAULT_STREAMING_URI,
};
use switchboard_core::events::{EventSender, EventsConfig, DEFAULT_EVENTS_BASE_URI};
use switchboard_core::store::DataStore;

/// Configuration for [`crate::Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use switchboard::Config;
/// let config = Config::from_sdk_key("sdk-key")
///     .with_start_wait(Duration::from_secs(2))
///     .with_offline(false);
/// ```
pub struct Config {
    pub(crate) sdk_key: String,
    pub(crate) stream_base_uri: String,
    pub(crate) polling_base_uri: String,
    pub(crate) events_base_uri: String,
    pub(crate) offline: bool,
    pub(crate) send_events: bool,
    pub(crate) start_wait: Duration,
    pub(crate) streaming: StreamingConfig,
    pub(crate) polling: PollingConfig,
    pub(crate) events: EventsConfig,
    pub(crate) big_segments: BigSegmentsConfig,
    pub(crate) data_store: Option<Arc<dyn DataStore>>,
    pub(crate) stream_source: Option<Box<dyn StreamSource>>,
    pub(crate) feature_requester: Option<Box<dyn FeatureRequester>>,
    pub(crate) event_sender: Option<Arc<dyn EventSender>>,
    pub(crate) big_segment_store: Option<Arc<dyn BigSegmentStore>>,
}

impl Config {
    /// Default value for [`Config::with_start_wait`].
    pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(5);

    /// Create a default configuration using the specified SDK key.
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Config {
        Config {
            sdk_key: sdk_key.into(),
            stream_base_uri: DEFAULT_STREAMING_URI.to_owned(),
            polling_base_uri: DEFAULT_POLLING_BASE_URI.to_owned(),
            events_base_uri: DEFAULT_EVENTS_BASE_URI.to_owned(),
            offline: false,
            send_events: true,
            start_wait: Config::DEFAULT_START_WAIT,
            streaming: StreamingConfig::new(),
            polling: PollingConfig::new(),
            events: EventsConfig::new(),
            big_segments: BigSegmentsConfig::new(),
            data_store: None,
            stream_source: None,
            feature_requester: None,
            event_sender: None,
            big_segment_store: None,
        }
    }

    /// The streaming endpoint URI handed to the pluggable stream transport.
    /// Clients should use the default setting in most cases.
    pub fn with_stream_base_uri(mut self, uri: impl Into<String>) -> Config {
        self.stream_base_uri = uri.into();
        self
    }

    /// The streaming endpoint URI currently configured.
    pub fn stream_base_uri(&self) -> &str {
        &self.stream_base_uri
    }

    /// Override the polling base URI. Clients should use the default setting
    /// in most cases.
    pub fn with_polling_base_uri(mut self, uri: impl Into<String>) -> Config {
        self.polling_base_uri = uri.into();
        self
    }

    /// Override the events base URI. Clients should use the default setting
    /// in most cases.
    pub fn with_events_base_uri(mut self, uri: impl Into<String>) -> Config {
        self.events_base_uri = uri.into();
        self
    }

    /// In offline mode the client makes no network connections of any kind
    /// and every evaluation returns the caller's default value.
    pub fn with_offline(mut self, offline: bool) -> Config {
        self.offline = offline;
        self
    }

    /// Disable analytics events entirely.
    pub fn with_send_events(mut self, send_events: bool) -> Config {
        self.send_events = send_events;
        self
    }

    /// How long [`crate::Client::build`] blocks waiting for the first data
    /// snapshot. Zero means do not wait.
    pub fn with_start_wait(mut self, start_wait: Duration) -> Config {
        self.start_wait = start_wait;
        self
    }

    /// Tune streaming reconnection behavior.
    pub fn with_streaming(mut self, streaming: StreamingConfig) -> Config {
        self.streaming = streaming;
        self
    }

    /// Tune the polling interval.
    pub fn with_polling(mut self, polling: PollingConfig) -> Config {
        self.polling = polling;
        self
    }

    /// Tune the event pipeline (capacity, flush interval, user key cache,
    /// inline users, diagnostics).
    pub fn with_events(mut self, events: EventsConfig) -> Config {
        self.events = events;
        self
    }

    /// Tune the big segment wrapper (cache size/TTL, status polling).
    pub fn with_big_segments(mut self, big_segments: BigSegmentsConfig) -> Config {
        self.big_segments = big_segments;
        self
    }

    /// Use a custom data store (for example a
    /// [`crate::CachingStoreWrapper`] over a persistent backend) instead of
    /// the default in-memory store. The store is owned by the host
    /// application, not disposed by the client.
    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Config {
        self.data_store = Some(store);
        self
    }

    /// Plug in a streaming transport. When present, the client synchronizes
    /// through it; otherwise it falls back to polling.
    pub fn with_stream_source(mut self, source: Box<dyn StreamSource>) -> Config {
        self.stream_source = Some(source);
        self
    }

    /// Replace the default HTTP snapshot requester used for polling.
    pub fn with_feature_requester(mut self, requester: Box<dyn FeatureRequester>) -> Config {
        self.feature_requester = Some(requester);
        self
    }

    /// Replace the default HTTP event sender.
    pub fn with_event_sender(mut self, sender: Arc<dyn EventSender>) -> Config {
        self.event_sender = Some(sender);
        self
    }

    /// Enable big segments by plugging in a membership store.
    pub fn with_big_segment_store(mut self, store: Arc<dyn BigSegmentStore>) -> Config {
        self.big_segment_store = Some(store);
        self
    }

    /// Create a [`crate::Client`] from this configuration.
    pub fn build(self) -> switchboard_core::Result<crate::Client> {
        crate::Client::build(self)
    }
}
