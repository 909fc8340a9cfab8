//! The background event pipeline: a bounded ingress queue feeding a
//! dispatcher thread that summarizes, deduplicates, and buffers events, and a
//! small pool of flush workers that deliver payloads.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::LoaderCache;
use crate::{SdkMetadata, User};

use super::diagnostics::DiagnosticsManager;
use super::event::{
    CustomEventOut, Event, FeatureRequestEvent, FeatureEventOut, IdentifyEventOut, IndexEventOut,
};
use super::{now_millis, EventSender, OutputEvent};

/// Configuration for [`EventProcessor`].
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Bound on the ingress queue and the outgoing buffer. Events beyond it
    /// are dropped (writers never block).
    pub capacity: usize,
    /// Wall-clock interval between automatic flushes.
    pub flush_interval: Duration,
    /// Bound on the recently-seen-user cache.
    pub user_keys_capacity: usize,
    /// Time-to-live of entries in the recently-seen-user cache.
    pub user_keys_flush_interval: Duration,
    /// Carry the full user on every feature/custom event instead of emitting
    /// index events.
    pub inline_users_in_events: bool,
    /// Size of the delivery worker pool.
    pub flush_workers: usize,
    /// Interval between periodic diagnostic records.
    pub diagnostic_recording_interval: Duration,
    /// Whether to send the diagnostic stream at all.
    pub send_diagnostics: bool,
}

impl EventsConfig {
    /// Default value for [`EventsConfig::capacity`].
    pub const DEFAULT_CAPACITY: usize = 10_000;
    /// Default value for [`EventsConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`EventsConfig::user_keys_capacity`].
    pub const DEFAULT_USER_KEYS_CAPACITY: usize = 1000;
    /// Default value for [`EventsConfig::user_keys_flush_interval`].
    pub const DEFAULT_USER_KEYS_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
    /// Default value for [`EventsConfig::flush_workers`].
    pub const DEFAULT_FLUSH_WORKERS: usize = 5;
    /// Default value for [`EventsConfig::diagnostic_recording_interval`].
    pub const DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(900);

    pub fn new() -> EventsConfig {
        EventsConfig::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> EventsConfig {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> EventsConfig {
        self.flush_interval = interval;
        self
    }

    pub fn with_user_keys_capacity(mut self, capacity: usize) -> EventsConfig {
        self.user_keys_capacity = capacity.max(1);
        self
    }

    pub fn with_user_keys_flush_interval(mut self, interval: Duration) -> EventsConfig {
        self.user_keys_flush_interval = interval;
        self
    }

    pub fn with_inline_users_in_events(mut self, inline: bool) -> EventsConfig {
        self.inline_users_in_events = inline;
        self
    }

    pub fn with_flush_workers(mut self, workers: usize) -> EventsConfig {
        self.flush_workers = workers.max(1);
        self
    }

    pub fn with_diagnostic_recording_interval(mut self, interval: Duration) -> EventsConfig {
        self.diagnostic_recording_interval = interval;
        self
    }

    pub fn with_send_diagnostics(mut self, send: bool) -> EventsConfig {
        self.send_diagnostics = send;
        self
    }
}

impl Default for EventsConfig {
    fn default() -> EventsConfig {
        EventsConfig {
            capacity: EventsConfig::DEFAULT_CAPACITY,
            flush_interval: EventsConfig::DEFAULT_FLUSH_INTERVAL,
            user_keys_capacity: EventsConfig::DEFAULT_USER_KEYS_CAPACITY,
            user_keys_flush_interval: EventsConfig::DEFAULT_USER_KEYS_FLUSH_INTERVAL,
            inline_users_in_events: false,
            flush_workers: EventsConfig::DEFAULT_FLUSH_WORKERS,
            diagnostic_recording_interval: EventsConfig::DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL,
            send_diagnostics: true,
        }
    }
}

/// Counters shared between the caller side, the dispatcher, and the flush
/// workers. They feed periodic diagnostic records.
#[derive(Default)]
struct PipelineStats {
    dropped_events: AtomicU64,
    overflow_logged: AtomicBool,
    deduplicated_users: AtomicU64,
    events_in_last_batch: AtomicU64,
    last_known_server_time: AtomicU64,
    /// Set after a 401/403 from the events service; nothing is sent after.
    disabled: AtomicBool,
}

enum DispatchMessage {
    Event(Box<Event>),
    Flush,
    Shutdown,
}

enum PayloadJob {
    Analytics(Vec<OutputEvent>),
    Diagnostic(serde_json::Value),
}

/// The analytics event pipeline.
///
/// `send_event` never blocks: the ingress queue is bounded and overflow drops
/// the event (logged once per flush window). A dedicated dispatcher thread
/// owns the buffer; payloads are delivered by a bounded worker pool so bursts
/// do not stall ingestion.
pub struct EventProcessor {
    inbox: SyncSender<DispatchMessage>,
    stats: Arc<PipelineStats>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
}

impl EventProcessor {
    pub fn start(
        config: EventsConfig,
        sdk_key: &str,
        sdk_metadata: SdkMetadata,
        sender: Arc<dyn EventSender>,
    ) -> std::io::Result<EventProcessor> {
        let (inbox, inbox_rx) = sync_channel::<DispatchMessage>(config.capacity);
        let stats = Arc::new(PipelineStats::default());

        let (workers_tx, workers_rx) = sync_channel::<PayloadJob>(config.flush_workers);
        let workers_rx = Arc::new(Mutex::new(workers_rx));
        let mut worker_handles = Vec::with_capacity(config.flush_workers);
        for n in 0..config.flush_workers {
            let workers_rx = Arc::clone(&workers_rx);
            let sender = Arc::clone(&sender);
            let stats = Arc::clone(&stats);
            let handle = std::thread::Builder::new()
                .name(format!("switchboard-flush-{n}"))
                .spawn(move || run_flush_worker(workers_rx, sender, stats))?;
            worker_handles.push(handle);
        }

        let diagnostics = config
            .send_diagnostics
            .then(|| DiagnosticsManager::new(sdk_key, sdk_metadata));

        let dispatcher = {
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name("switchboard-events".to_owned())
                .spawn(move || {
                    Dispatcher {
                        user_keys: LoaderCache::new(
                            Some(config.user_keys_capacity),
                            Some(config.user_keys_flush_interval),
                        ),
                        config,
                        stats,
                        buffer: Vec::new(),
                        summarizer: super::summarizer::EventSummarizer::new(),
                        workers_tx,
                        worker_handles,
                        diagnostics,
                    }
                    .run(inbox_rx)
                })?
        };

        Ok(EventProcessor {
            inbox,
            stats,
            dispatcher: Some(dispatcher),
        })
    }

    /// Enqueue an event. Never blocks; on overflow the event is dropped and
    /// counted.
    pub fn send_event(&self, event: Event) {
        if self.stats.disabled.load(Ordering::SeqCst) {
            return;
        }
        match self.inbox.try_send(DispatchMessage::Event(Box::new(event))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_events.fetch_add(1, Ordering::SeqCst);
                if !self.stats.overflow_logged.swap(true, Ordering::SeqCst) {
                    log::warn!(target: "switchboard",
                        "event queue is full; dropping events (consider raising the event capacity)");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Trigger a flush of the current window. Does not wait for delivery.
    pub fn flush(&self) {
        let _ = self.inbox.try_send(DispatchMessage::Flush);
    }

    /// Flush remaining events and stop all pipeline threads. Blocks until
    /// in-flight deliveries complete or time out.
    pub fn close(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            let _ = self.inbox.send(DispatchMessage::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

struct Dispatcher {
    config: EventsConfig,
    stats: Arc<PipelineStats>,
    buffer: Vec<OutputEvent>,
    summarizer: super::summarizer::EventSummarizer,
    user_keys: LoaderCache<String, ()>,
    workers_tx: SyncSender<PayloadJob>,
    worker_handles: Vec<std::thread::JoinHandle<()>>,
    diagnostics: Option<DiagnosticsManager>,
}

impl Dispatcher {
    fn run(mut self, inbox: Receiver<DispatchMessage>) {
        if let Some(diagnostics) = &self.diagnostics {
            let _ = self
                .workers_tx
                .try_send(PayloadJob::Diagnostic(diagnostics.init_event()));
        }

        let mut next_flush = Instant::now() + self.config.flush_interval;
        let mut next_diagnostic = Instant::now() + self.config.diagnostic_recording_interval;

        loop {
            let mut deadline = next_flush;
            if self.diagnostics.is_some() {
                deadline = deadline.min(next_diagnostic);
            }
            let timeout = deadline.saturating_duration_since(Instant::now());

            match inbox.recv_timeout(timeout) {
                Ok(DispatchMessage::Event(event)) => self.process_event(*event),
                Ok(DispatchMessage::Flush) => {
                    self.flush();
                    next_flush = Instant::now() + self.config.flush_interval;
                }
                Ok(DispatchMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    if now >= next_flush {
                        self.flush();
                        next_flush = now + self.config.flush_interval;
                    }
                    if self.diagnostics.is_some() && now >= next_diagnostic {
                        self.send_periodic_diagnostic();
                        next_diagnostic = now + self.config.diagnostic_recording_interval;
                    }
                }
            }
        }

        // Closing the job channel lets the workers finish in-flight sends and
        // exit; delivery timeouts bound how long this join can take.
        drop(self.workers_tx);
        for handle in self.worker_handles {
            let _ = handle.join();
        }
    }

    fn process_event(&mut self, event: Event) {
        let inline = self.config.inline_users_in_events;
        match event {
            Event::FeatureRequest(event) => {
                self.summarizer.add(&event);
                if inline {
                    self.notice_user(&event.user);
                } else {
                    self.index_user_if_new(&event.user, event.creation_date);
                }
                if event.track_events {
                    self.push(OutputEvent::Feature(FeatureEventOut::from_event(
                        &event, inline,
                    )));
                }
                if self.should_debug(&event) {
                    // Debug events always carry the full user.
                    self.push(OutputEvent::Debug(FeatureEventOut::from_event(
                        &event, true,
                    )));
                }
            }
            Event::Identify(event) => {
                self.notice_user(&event.user);
                self.push(OutputEvent::Identify(IdentifyEventOut {
                    creation_date: event.creation_date,
                    key: event.user.key().to_owned(),
                    user: event.user,
                }));
            }
            Event::Custom(event) => {
                if !inline {
                    self.index_user_if_new(&event.user, event.creation_date);
                }
                self.push(OutputEvent::Custom(CustomEventOut {
                    creation_date: event.creation_date,
                    key: event.key,
                    user: inline.then(|| event.user.clone()),
                    user_key: (!inline).then(|| event.user.key().to_owned()),
                    data: event.data,
                    metric_value: event.metric_value,
                }));
            }
        }
    }

    /// Record the user as recently seen; returns whether it already was.
    fn notice_user(&mut self, user: &User) -> bool {
        let key = user.key().to_owned();
        let known = self.user_keys.get(&key).is_some();
        self.user_keys.insert(key, ());
        known
    }

    fn index_user_if_new(&mut self, user: &User, creation_date: u64) {
        if self.notice_user(user) {
            self.stats.deduplicated_users.fetch_add(1, Ordering::SeqCst);
        } else {
            self.push(OutputEvent::Index(IndexEventOut {
                creation_date,
                user: user.clone(),
            }));
        }
    }

    fn should_debug(&self, event: &FeatureRequestEvent) -> bool {
        match event.debug_events_until_date {
            None => false,
            Some(until) => {
                // The cutoff honors server time when known, so a client with
                // a skewed clock cannot debug forever.
                let server_time = self.stats.last_known_server_time.load(Ordering::SeqCst);
                until > now_millis() && until > server_time
            }
        }
    }

    fn push(&mut self, event: OutputEvent) {
        if self.buffer.len() >= self.config.capacity {
            self.stats.dropped_events.fetch_add(1, Ordering::SeqCst);
            if !self.stats.overflow_logged.swap(true, Ordering::SeqCst) {
                log::warn!(target: "switchboard",
                    "event buffer is full; dropping events (consider raising the event capacity)");
            }
            return;
        }
        self.buffer.push(event);
    }

    fn flush(&mut self) {
        // The overflow warning fires at most once per flush window.
        self.stats.overflow_logged.store(false, Ordering::SeqCst);

        let mut payload = std::mem::take(&mut self.buffer);
        if let Some(summary) = self.summarizer.take() {
            payload.push(OutputEvent::Summary(summary));
        }
        if payload.is_empty() {
            return;
        }
        self.stats
            .events_in_last_batch
            .store(payload.len() as u64, Ordering::SeqCst);
        if self.stats.disabled.load(Ordering::SeqCst) {
            return;
        }

        match self.workers_tx.try_send(PayloadJob::Analytics(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(PayloadJob::Analytics(payload))) => {
                self.stats
                    .dropped_events
                    .fetch_add(payload.len() as u64, Ordering::SeqCst);
                log::warn!(target: "switchboard",
                    "all flush workers are busy; dropping {} events", payload.len());
            }
            Err(_) => {}
        }
    }

    fn send_periodic_diagnostic(&mut self) {
        let Some(diagnostics) = &mut self.diagnostics else {
            return;
        };
        let event = diagnostics.periodic_event(
            self.stats.dropped_events.swap(0, Ordering::SeqCst),
            self.stats.deduplicated_users.swap(0, Ordering::SeqCst),
            self.stats.events_in_last_batch.load(Ordering::SeqCst),
        );
        let _ = self.workers_tx.try_send(PayloadJob::Diagnostic(event));
    }
}

fn run_flush_worker(
    jobs: Arc<Mutex<Receiver<PayloadJob>>>,
    sender: Arc<dyn EventSender>,
    stats: Arc<PipelineStats>,
) {
    loop {
        let job = match jobs.lock() {
            Ok(receiver) => match receiver.recv() {
                Ok(job) => job,
                Err(_) => return,
            },
            Err(_) => return,
        };

        if stats.disabled.load(Ordering::SeqCst) {
            continue;
        }
        let result = match &job {
            PayloadJob::Analytics(events) => sender.send_analytics(events),
            PayloadJob::Diagnostic(event) => sender.send_diagnostic(event),
        };
        if result.must_shutdown {
            stats.disabled.store(true, Ordering::SeqCst);
        }
        if let Some(server_time) = result.server_time {
            stats
                .last_known_server_time
                .store(server_time, Ordering::SeqCst);
        }
    }
}
