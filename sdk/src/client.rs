use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use switchboard_core::bigseg::BigSegmentStoreWrapper;
use switchboard_core::datasource::{
    DataSourceStatus, DataSourceStatusProvider, FeatureRequester, NullUpdateProcessor,
    PollingProcessor, ReqwestFeatureRequester, StreamingProcessor, UpdateProcessor,
};
use switchboard_core::eval::{
    is_experimentation_enabled, ErrorKind, EvalResult, EvaluationDetail, EvaluationStore,
    Evaluator, PrerequisiteEvent, Reason,
};
use switchboard_core::events::{
    now_millis, CustomEvent, Event, EventProcessor, EventSender, FeatureRequestEvent,
    IdentifyEvent, ReqwestEventSender,
};
use switchboard_core::store::{DataKind, DataStore, InMemoryDataStore, StoreItem};
use switchboard_core::{FeatureFlag, Result, SdkMetadata, User};

use crate::all_flags::{AllFlagsOptions, FeatureFlagsState, FlagState};
use crate::config::Config;

const SDK_METADATA: SdkMetadata = SdkMetadata {
    name: "SwitchboardRustServer",
    version: env!("CARGO_PKG_VERSION"),
};

/// A typed evaluation result: the value served, the index of the variation it
/// came from, and the reason for the choice.
#[derive(Debug, Clone, PartialEq)]
pub struct Detail<T> {
    pub value: T,
    pub variation_index: Option<i64>,
    pub reason: Reason,
}

/// The SDK client: wires the data store, update processor, event pipeline,
/// and big segment wrapper together behind typed evaluation methods.
///
/// Evaluation never fails outward: whatever goes wrong, the caller's default
/// value is returned and the reason says why.
pub struct Client {
    sdk_key: String,
    offline: bool,
    store: Arc<dyn DataStore>,
    update_processor: Box<dyn UpdateProcessor>,
    event_processor: Option<EventProcessor>,
    big_segments: Option<BigSegmentStoreWrapper>,
    data_source_status: Arc<DataSourceStatusProvider>,
}

impl Client {
    /// Construct and start a client.
    ///
    /// Unless the configuration is offline or `start_wait` is zero, this
    /// blocks up to `start_wait` for the first data snapshot; on timeout the
    /// client is returned anyway and serves defaults until data arrives.
    pub fn build(mut config: Config) -> Result<Client> {
        let store: Arc<dyn DataStore> = match config.data_store.take() {
            Some(store) => store,
            None => Arc::new(InMemoryDataStore::new()),
        };
        let data_source_status = Arc::new(DataSourceStatusProvider::new());
        let offline = config.offline;

        let update_processor: Box<dyn UpdateProcessor> = if offline {
            log::info!(target: "switchboard",
                "starting in offline mode; no network activity will occur");
            Box::new(NullUpdateProcessor)
        } else if let Some(source) = config.stream_source.take() {
            Box::new(StreamingProcessor::start(
                source,
                Arc::clone(&store),
                config.streaming.clone(),
                Arc::clone(&data_source_status),
            )?)
        } else {
            let requester: Box<dyn FeatureRequester> = match config.feature_requester.take() {
                Some(requester) => requester,
                None => Box::new(ReqwestFeatureRequester::new(
                    &config.polling_base_uri,
                    config.sdk_key.clone(),
                    SDK_METADATA,
                )?),
            };
            Box::new(PollingProcessor::start(
                requester,
                Arc::clone(&store),
                config.polling.clone(),
                Arc::clone(&data_source_status),
            )?)
        };

        let event_processor = if offline || !config.send_events {
            None
        } else {
            let sender: Arc<dyn EventSender> = match config.event_sender.take() {
                Some(sender) => sender,
                None => Arc::new(ReqwestEventSender::new(
                    &config.events_base_uri,
                    config.sdk_key.clone(),
                    SDK_METADATA,
                )?),
            };
            Some(EventProcessor::start(
                config.events.clone(),
                &config.sdk_key,
                SDK_METADATA,
                sender,
            )?)
        };

        let big_segments = match config.big_segment_store.take() {
            Some(bss) if !offline => {
                Some(BigSegmentStoreWrapper::start(bss, config.big_segments.clone())?)
            }
            _ => None,
        };

        let client = Client {
            sdk_key: config.sdk_key,
            offline,
            store,
            update_processor,
            event_processor,
            big_segments,
            data_source_status,
        };

        if !offline && !config.start_wait.is_zero() {
            if client
                .update_processor
                .wait_for_initialization(config.start_wait)
            {
                log::info!(target: "switchboard", "client initialized");
            } else {
                log::warn!(target: "switchboard",
                    "client did not initialize within the start wait; evaluations will use defaults until data arrives");
            }
        }

        Ok(client)
    }

    /// True once the client has received its first data snapshot (always true
    /// in offline mode). Non-blocking.
    pub fn initialized(&self) -> bool {
        self.offline || self.update_processor.initialized()
    }

    /// Evaluate a boolean flag.
    pub fn bool_variation(&self, user: &User, flag_key: &str, default: bool) -> bool {
        self.variation_internal(user, flag_key, json!(default), default, &Value::as_bool, false)
            .value
    }

    /// Evaluate a boolean flag, with the reason.
    pub fn bool_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: bool,
    ) -> Detail<bool> {
        self.variation_internal(user, flag_key, json!(default), default, &Value::as_bool, true)
    }

    /// Evaluate an integer flag. Float variations are truncated.
    pub fn int_variation(&self, user: &User, flag_key: &str, default: i64) -> i64 {
        self.variation_internal(user, flag_key, json!(default), default, &as_int, false)
            .value
    }

    /// Evaluate an integer flag, with the reason.
    pub fn int_variation_detail(&self, user: &User, flag_key: &str, default: i64) -> Detail<i64> {
        self.variation_internal(user, flag_key, json!(default), default, &as_int, true)
    }

    /// Evaluate a numeric flag.
    pub fn float_variation(&self, user: &User, flag_key: &str, default: f64) -> f64 {
        self.variation_internal(user, flag_key, json!(default), default, &Value::as_f64, false)
            .value
    }

    /// Evaluate a numeric flag, with the reason.
    pub fn float_variation_detail(&self, user: &User, flag_key: &str, default: f64) -> Detail<f64> {
        self.variation_internal(user, flag_key, json!(default), default, &Value::as_f64, true)
    }

    /// Evaluate a string flag.
    pub fn string_variation(&self, user: &User, flag_key: &str, default: &str) -> String {
        self.variation_internal(
            user,
            flag_key,
            json!(default),
            default.to_owned(),
            &as_string,
            false,
        )
        .value
    }

    /// Evaluate a string flag, with the reason.
    pub fn string_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: &str,
    ) -> Detail<String> {
        self.variation_internal(
            user,
            flag_key,
            json!(default),
            default.to_owned(),
            &as_string,
            true,
        )
    }

    /// Evaluate a flag of any JSON type.
    pub fn json_variation(&self, user: &User, flag_key: &str, default: Value) -> Value {
        self.variation_internal(
            user,
            flag_key,
            default.clone(),
            default,
            &|v: &Value| Some(v.clone()),
            false,
        )
        .value
    }

    /// Evaluate a flag of any JSON type, with the reason.
    pub fn json_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: Value,
    ) -> Detail<Value> {
        self.variation_internal(
            user,
            flag_key,
            default.clone(),
            default,
            &|v: &Value| Some(v.clone()),
            true,
        )
    }

    /// Evaluate every flag for the user and return the snapshot used to
    /// bootstrap client-side SDKs. Emits no analytics events. One bad flag
    /// cannot poison the batch; it simply reports an error reason.
    pub fn all_flags_state(&self, user: &User, options: AllFlagsOptions) -> FeatureFlagsState {
        if self.offline {
            log::warn!(target: "switchboard", "all_flags_state called in offline mode");
            return FeatureFlagsState::invalid();
        }
        if user.key().is_empty() {
            log::warn!(target: "switchboard", "all_flags_state called without a user key");
            return FeatureFlagsState::invalid();
        }
        if !self.initialized() {
            if self.store.initialized() {
                log::warn!(target: "switchboard",
                    "all_flags_state called before initialization; using last known flag data");
            } else {
                log::warn!(target: "switchboard",
                    "all_flags_state called before initialization; no flag data available");
                return FeatureFlagsState::invalid();
            }
        }

        let mut state = FeatureFlagsState::new();
        for (key, item) in self.store.all(DataKind::Features) {
            let StoreItem::Flag(flag) = item else {
                continue;
            };
            if options.client_side_only && !flag.client_side {
                continue;
            }

            let detail = match catch_unwind(AssertUnwindSafe(|| self.evaluate(&flag, user))) {
                Ok(result) => result.detail,
                Err(_) => {
                    log::error!(target: "switchboard",
                        "panic during evaluation of flag '{key}'");
                    EvaluationDetail {
                        value: None,
                        variation_index: None,
                        reason: Reason::Error {
                            error_kind: ErrorKind::Exception,
                        },
                    }
                }
            };

            let tracked = flag.track_events || is_experimentation_enabled(&flag, &detail.reason);
            let in_debug_window = flag
                .debug_events_until_date
                .map_or(false, |until| until > now_millis());
            let include_details =
                !options.details_only_for_tracked_flags || tracked || in_debug_window;

            state.add_flag(
                key,
                detail.value,
                FlagState {
                    version: include_details.then_some(flag.version),
                    variation: detail.variation_index,
                    reason: (options.with_reasons && include_details).then_some(detail.reason),
                    track_events: tracked,
                    debug_events_until_date: flag.debug_events_until_date,
                },
            );
        }
        state
    }

    /// Report the user to the events service (e.g. on login), so dashboards
    /// see it even before any flag evaluation.
    pub fn identify(&self, user: User) {
        if user.key().is_empty() {
            log::warn!(target: "switchboard", "identify called without a user key");
            return;
        }
        self.send_event(Event::Identify(IdentifyEvent {
            creation_date: now_millis(),
            user,
        }));
    }

    /// Record a custom event.
    pub fn track_event(&self, key: impl Into<String>, user: User) {
        self.track(key, user, None, None);
    }

    /// Record a custom event carrying extra data.
    pub fn track_data(&self, key: impl Into<String>, user: User, data: Value) {
        self.track(key, user, Some(data), None);
    }

    /// Record a custom event carrying a numeric metric.
    pub fn track_metric(&self, key: impl Into<String>, user: User, metric_value: f64) {
        self.track(key, user, None, Some(metric_value));
    }

    fn track(
        &self,
        key: impl Into<String>,
        user: User,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) {
        if user.key().is_empty() {
            log::warn!(target: "switchboard", "track called without a user key");
            return;
        }
        self.send_event(Event::Custom(CustomEvent {
            creation_date: now_millis(),
            key: key.into(),
            user,
            data,
            metric_value,
        }));
    }

    /// HMAC-SHA256 of the user key under the SDK key, in lowercase hex, for
    /// client-side secure mode. Empty when the user has no key.
    pub fn secure_mode_hash(&self, user: &User) -> String {
        if user.key().is_empty() {
            return String::new();
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(self.sdk_key.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(user.key().as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    /// Current data source status (initializing/valid/interrupted/off).
    pub fn data_source_status(&self) -> DataSourceStatus {
        self.data_source_status.status()
    }

    /// Receive a notification for every data source state transition.
    pub fn subscribe_data_source_status(&self) -> std::sync::mpsc::Receiver<DataSourceStatus> {
        self.data_source_status.subscribe()
    }

    /// Deliver buffered analytics events now instead of waiting for the flush
    /// interval. Does not block.
    pub fn flush(&self) {
        if let Some(events) = &self.event_processor {
            events.flush();
        }
    }

    /// Shut down: stop synchronizing, stop the big segment poller, and flush
    /// and stop the event pipeline (bounded by the delivery timeout).
    pub fn close(&mut self) {
        self.update_processor.stop();
        if let Some(big_segments) = &mut self.big_segments {
            big_segments.stop();
        }
        if let Some(events) = &mut self.event_processor {
            events.close();
        }
    }

    fn evaluate(&self, flag: &FeatureFlag, user: &User) -> EvalResult {
        match &self.big_segments {
            Some(wrapper) => Evaluator::with_big_segments(&self.store, wrapper),
            None => Evaluator::new(&self.store),
        }
        .evaluate(flag, user)
    }

    fn variation_internal<T: Clone>(
        &self,
        user: &User,
        flag_key: &str,
        default_json: Value,
        default_value: T,
        convert: &dyn Fn(&Value) -> Option<T>,
        include_reason: bool,
    ) -> Detail<T> {
        let error = |kind: ErrorKind| Detail {
            value: default_value.clone(),
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        };

        if self.offline {
            return error(ErrorKind::ClientNotReady);
        }
        if user.key().is_empty() {
            log::warn!(target: "switchboard",
                "evaluation of flag '{flag_key}' called without a user key");
            return error(ErrorKind::UserNotSpecified);
        }

        if !self.initialized() {
            if self.store.initialized() {
                log::warn!(target: "switchboard",
                    "client not initialized; evaluating flag '{flag_key}' from last known data");
            } else {
                log::warn!(target: "switchboard",
                    "client not initialized and no flag data available; returning default for '{flag_key}'");
                let detail = error(ErrorKind::ClientNotReady);
                self.send_unknown_flag_event(user, flag_key, default_json, &detail.reason, include_reason);
                return detail;
            }
        }

        let Some(flag) = self.store.flag(flag_key) else {
            log::info!(target: "switchboard", "unknown flag '{flag_key}'; returning default");
            let detail = error(ErrorKind::FlagNotFound);
            self.send_unknown_flag_event(user, flag_key, default_json, &detail.reason, include_reason);
            return detail;
        };

        let result = match catch_unwind(AssertUnwindSafe(|| self.evaluate(&flag, user))) {
            Ok(result) => result,
            Err(_) => {
                log::error!(target: "switchboard",
                    "panic during evaluation of flag '{flag_key}'");
                EvalResult {
                    detail: EvaluationDetail {
                        value: None,
                        variation_index: None,
                        reason: Reason::Error {
                            error_kind: ErrorKind::Exception,
                        },
                    },
                    prerequisite_events: Vec::new(),
                }
            }
        };

        // Type-check the evaluated value; a mismatch serves the default and
        // reports WRONG_TYPE, and the event reflects what was served.
        let (value, event_value, variation_index, reason) = match result.detail.value {
            None => (
                default_value,
                default_json.clone(),
                result.detail.variation_index,
                result.detail.reason,
            ),
            Some(evaluated) => match convert(&evaluated) {
                Some(typed) => (
                    typed,
                    evaluated,
                    result.detail.variation_index,
                    result.detail.reason,
                ),
                None => {
                    log::warn!(target: "switchboard",
                        "flag '{flag_key}' value does not have the requested type");
                    (
                        default_value,
                        default_json.clone(),
                        None,
                        Reason::Error {
                            error_kind: ErrorKind::WrongType,
                        },
                    )
                }
            },
        };

        for prerequisite in result.prerequisite_events {
            self.send_event(prerequisite_to_event(user, prerequisite, include_reason));
        }

        let track_events = flag.track_events || is_experimentation_enabled(&flag, &reason);
        self.send_event(Event::FeatureRequest(FeatureRequestEvent {
            creation_date: now_millis(),
            key: flag.key.clone(),
            user: user.clone(),
            version: Some(flag.version),
            variation: variation_index,
            value: Some(event_value),
            default: Some(default_json),
            reason: (include_reason || reason.is_in_experiment()).then(|| reason.clone()),
            prereq_of: None,
            track_events,
            debug_events_until_date: flag.debug_events_until_date,
        }));

        Detail {
            value,
            variation_index,
            reason,
        }
    }

    fn send_unknown_flag_event(
        &self,
        user: &User,
        flag_key: &str,
        default_json: Value,
        reason: &Reason,
        include_reason: bool,
    ) {
        self.send_event(Event::FeatureRequest(FeatureRequestEvent {
            creation_date: now_millis(),
            key: flag_key.to_owned(),
            user: user.clone(),
            version: None,
            variation: None,
            value: Some(default_json.clone()),
            default: Some(default_json),
            reason: include_reason.then(|| reason.clone()),
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
        }));
    }

    fn send_event(&self, event: Event) {
        if let Some(events) = &self.event_processor {
            events.send_event(event);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn prerequisite_to_event(user: &User, event: PrerequisiteEvent, include_reason: bool) -> Event {
    let include_reason = include_reason || event.detail.reason.is_in_experiment();
    Event::FeatureRequest(FeatureRequestEvent {
        creation_date: now_millis(),
        key: event.flag_key,
        user: user.clone(),
        version: Some(event.flag_version),
        variation: event.detail.variation_index,
        value: event.detail.value,
        default: None,
        reason: include_reason.then_some(event.detail.reason),
        prereq_of: Some(event.prerequisite_of),
        track_events: event.track_events,
        debug_events_until_date: event.debug_events_until_date,
    })
}

fn as_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use switchboard_core::datasource::{StreamConnection, StreamMessage, StreamSource};
    use switchboard_core::events::{EventSender, EventsConfig, OutputEvent, SendResult};
    use switchboard_core::Error;

    use super::*;

    /// Delivers one `put` with the given data, then lets the stream thread
    /// terminate.
    struct TestStreamSource {
        put_data: Mutex<Option<String>>,
    }

    impl TestStreamSource {
        fn new(flags: Value, segments: Value) -> Box<TestStreamSource> {
            let data = json!({"path": "/", "data": {"flags": flags, "segments": segments}});
            Box::new(TestStreamSource {
                put_data: Mutex::new(Some(data.to_string())),
            })
        }
    }

    struct OnePutConnection {
        put_data: Option<String>,
    }

    impl StreamSource for TestStreamSource {
        fn connect(
            &mut self,
        ) -> switchboard_core::Result<Box<dyn StreamConnection>> {
            match self.put_data.lock().unwrap().take() {
                Some(put_data) => Ok(Box::new(OnePutConnection {
                    put_data: Some(put_data),
                })),
                None => Err(Error::Unauthorized),
            }
        }
    }

    impl StreamConnection for OnePutConnection {
        fn next_message(&mut self) -> switchboard_core::Result<StreamMessage> {
            match self.put_data.take() {
                Some(data) => Ok(StreamMessage {
                    event: "put".to_owned(),
                    data,
                }),
                None => Err(Error::StreamClosed("test stream finished".to_owned())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        analytics: Mutex<Vec<Value>>,
    }

    impl RecordingSender {
        fn events(&self) -> Vec<Value> {
            self.analytics.lock().unwrap().clone()
        }

        fn events_of_kind(&self, kind: &str) -> Vec<Value> {
            self.events()
                .into_iter()
                .filter(|e| e["kind"] == kind)
                .collect()
        }
    }

    impl EventSender for RecordingSender {
        fn send_analytics(&self, events: &[OutputEvent]) -> SendResult {
            let mut recorded = self.analytics.lock().unwrap();
            for event in events {
                recorded.push(serde_json::to_value(event).unwrap());
            }
            SendResult {
                success: true,
                must_shutdown: false,
                server_time: None,
            }
        }

        fn send_diagnostic(&self, _event: &Value) -> SendResult {
            SendResult {
                success: true,
                must_shutdown: false,
                server_time: None,
            }
        }
    }

    fn test_client(flags: Value, sender: Arc<RecordingSender>) -> Client {
        let _ = env_logger::builder().is_test(true).try_init();
        Client::build(
            Config::from_sdk_key("secret")
                .with_stream_source(TestStreamSource::new(flags, json!({})))
                .with_event_sender(sender)
                .with_events(
                    EventsConfig::new()
                        .with_flush_interval(Duration::from_secs(60))
                        .with_send_diagnostics(false),
                )
                .with_start_wait(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[test]
    fn off_flag_serves_its_off_variation() {
        let sender = Arc::new(RecordingSender::default());
        let mut client = test_client(
            json!({"key": {
                "key": "key", "version": 1, "on": false,
                "offVariation": 0, "variations": [true]
            }}),
            Arc::clone(&sender),
        );
        assert!(client.initialized());

        let detail = client.bool_variation_detail(&User::with_key("userkey"), "key", false);
        assert_eq!(
            detail,
            Detail {
                value: true,
                variation_index: Some(0),
                reason: Reason::Off
            }
        );
        client.close();
    }

    #[test]
    fn wrong_type_request_serves_default_but_still_emits_an_event() {
        let sender = Arc::new(RecordingSender::default());
        let mut client = test_client(
            json!({"key": {
                "key": "key", "version": 2, "on": false,
                "offVariation": 1, "variations": ["x", "value2"]
            }}),
            Arc::clone(&sender),
        );

        let detail = client.int_variation_detail(&User::with_key("u"), "key", 1);
        assert_eq!(
            detail,
            Detail {
                value: 1,
                variation_index: None,
                reason: Reason::Error {
                    error_kind: ErrorKind::WrongType
                }
            }
        );

        client.close();
        let summaries = sender.events_of_kind("summary");
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0]["features"]["key"].is_object());
    }

    #[test]
    fn unknown_flag_returns_default_with_an_unversioned_event() {
        let sender = Arc::new(RecordingSender::default());
        let mut client = test_client(json!({}), Arc::clone(&sender));

        let detail = client.string_variation_detail(&User::with_key("u"), "ghost", "fallback");
        assert_eq!(detail.value, "fallback");
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );

        client.close();
        let summaries = sender.events_of_kind("summary");
        let counter = &summaries[0]["features"]["ghost"]["counters"][0];
        assert_eq!(counter["unknown"], json!(true));
        assert!(counter.get("version").is_none());
    }

    #[test]
    fn empty_user_key_returns_default_and_emits_nothing() {
        let sender = Arc::new(RecordingSender::default());
        let mut client = test_client(
            json!({"key": {
                "key": "key", "version": 1, "on": false,
                "offVariation": 0, "variations": [true]
            }}),
            Arc::clone(&sender),
        );

        let detail = client.bool_variation_detail(&User::with_key(""), "key", false);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );
        client.close();
        assert!(sender.events().is_empty());
    }

    #[test]
    fn offline_client_serves_defaults_and_never_touches_the_network() {
        let mut client = Client::build(
            Config::from_sdk_key("secret")
                .with_offline(true)
                .with_start_wait(Duration::from_secs(0)),
        )
        .unwrap();

        assert!(client.initialized());
        assert!(!client.bool_variation(&User::with_key("u"), "any-flag", false));

        let state = client.all_flags_state(&User::with_key("u"), AllFlagsOptions::new());
        assert!(!state.is_valid());
        assert_eq!(
            serde_json::to_value(&state).unwrap()["$valid"],
            json!(false)
        );
        client.close();
    }

    #[test]
    fn all_flags_state_returns_values_and_metadata() {
        let sender = Arc::new(RecordingSender::default());
        let flags = json!({
            "key1": {"key": "key1", "version": 100, "on": true, "salt": "a",
                     "fallthrough": {"variation": 0}, "variations": ["value1"]},
            "key2": {"key": "key2", "version": 200, "on": true, "salt": "b",
                     "fallthrough": {"variation": 1}, "variations": ["x", "value2"]}
        });
        let mut client = test_client(flags, Arc::clone(&sender));
        let user = User::with_key("userkey");

        let state = client.all_flags_state(&user, AllFlagsOptions::new());
        assert!(state.is_valid());
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["key1"], "value1");
        assert_eq!(v["key2"], "value2");
        assert_eq!(v["$valid"], json!(true));
        assert_eq!(
            v["$flagsState"]["key1"],
            json!({"version": 100, "variation": 0})
        );
        assert_eq!(
            v["$flagsState"]["key2"],
            json!({"version": 200, "variation": 1})
        );
        assert!(v["$flagsState"]["key1"].get("reason").is_none());

        let with_reasons = client.all_flags_state(
            &user,
            AllFlagsOptions {
                with_reasons: true,
                ..AllFlagsOptions::new()
            },
        );
        let v = serde_json::to_value(&with_reasons).unwrap();
        assert_eq!(
            v["$flagsState"]["key1"]["reason"],
            json!({"kind": "FALLTHROUGH"})
        );

        client.close();
        assert!(
            sender.events().is_empty(),
            "all_flags_state must not emit analytics events"
        );
    }

    #[test]
    fn all_flags_state_can_filter_to_client_side_flags() {
        let sender = Arc::new(RecordingSender::default());
        let flags = json!({
            "server": {"key": "server", "version": 1, "on": true, "salt": "a",
                       "fallthrough": {"variation": 0}, "variations": [1]},
            "client": {"key": "client", "version": 1, "on": true, "salt": "b", "clientSide": true,
                       "fallthrough": {"variation": 0}, "variations": [2]}
        });
        let mut client = test_client(flags, Arc::clone(&sender));

        let state = client.all_flags_state(
            &User::with_key("u"),
            AllFlagsOptions {
                client_side_only: true,
                ..AllFlagsOptions::new()
            },
        );
        let v = serde_json::to_value(&state).unwrap();
        assert!(v.get("server").is_none());
        assert_eq!(v["client"], json!(2));
        client.close();
    }

    #[test]
    fn prerequisite_events_precede_the_terminal_event() {
        let sender = Arc::new(RecordingSender::default());
        let flags = json!({
            "outer": {"key": "outer", "version": 1, "on": true, "salt": "a",
                      "trackEvents": true,
                      "prerequisites": [{"key": "inner", "variation": 1}],
                      "offVariation": 0, "fallthrough": {"variation": 1},
                      "variations": [false, true]},
            "inner": {"key": "inner", "version": 1, "on": true, "salt": "b",
                      "trackEvents": true,
                      "offVariation": 0, "fallthrough": {"variation": 1},
                      "variations": [false, true]}
        });
        let mut client = test_client(flags, Arc::clone(&sender));

        assert!(client.bool_variation(&User::with_key("u"), "outer", false));
        client.close();

        let features = sender.events_of_kind("feature");
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["key"], "inner");
        assert_eq!(features[0]["prereqOf"], "outer");
        assert_eq!(features[1]["key"], "outer");
        assert!(features[1].get("prereqOf").is_none());
    }

    #[test]
    fn identify_and_track_emit_events() {
        let sender = Arc::new(RecordingSender::default());
        let mut client = test_client(json!({}), Arc::clone(&sender));

        client.identify(User::with_key("u"));
        client.track_data("clicked", User::with_key("u"), json!({"page": "home"}));
        client.track_metric("latency", User::with_key("u"), 123.4);
        client.close();

        assert_eq!(sender.events_of_kind("identify").len(), 1);
        let customs = sender.events_of_kind("custom");
        assert_eq!(customs.len(), 2);
        assert_eq!(customs[0]["key"], "clicked");
        assert_eq!(customs[0]["data"]["page"], "home");
        assert_eq!(customs[1]["metricValue"], 123.4);
    }

    #[test]
    fn secure_mode_hash_matches_the_reference_vector() {
        let mut client = Client::build(
            Config::from_sdk_key("secret")
                .with_offline(true)
                .with_start_wait(Duration::ZERO),
        )
        .unwrap();

        assert_eq!(
            client.secure_mode_hash(&User::with_key("Message")),
            "aa747c502a898200f9e4fa21bac68136f886a0e27aec70ba06daf2e2a5cb5597"
        );
        assert_eq!(client.secure_mode_hash(&User::with_key("")), "");
        client.close();
    }

    #[test]
    fn uninitialized_client_without_data_reports_client_not_ready() {
        let sender = Arc::new(RecordingSender::default());
        let client = Client::build(
            Config::from_sdk_key("secret")
                .with_stream_source(Box::new(TestStreamSource {
                    // No put: the source immediately reports unauthorized.
                    put_data: Mutex::new(None),
                }))
                .with_event_sender(Arc::clone(&sender) as _)
                .with_events(
                    EventsConfig::new()
                        .with_flush_interval(Duration::from_secs(60))
                        .with_send_diagnostics(false),
                )
                .with_start_wait(Duration::from_secs(5)),
        )
        .unwrap();
        let mut client = client;

        assert!(!client.initialized());
        let detail = client.bool_variation_detail(&User::with_key("u"), "key", true);
        assert_eq!(
            detail,
            Detail {
                value: true,
                variation_index: None,
                reason: Reason::Error {
                    error_kind: ErrorKind::ClientNotReady
                }
            }
        );
        client.close();
    }
}
