//! The analytics event pipeline: in-memory buffering, user deduplication,
//! summarization, and background delivery to the control plane.
mod diagnostics;
mod event;
mod processor;
mod sender;
mod summarizer;

pub use event::{
    CustomEvent, CustomEventOut, Event, FeatureEventOut, FeatureRequestEvent, IdentifyEvent,
    IdentifyEventOut, IndexEventOut, OutputEvent,
};
pub use processor::{EventProcessor, EventsConfig};
pub use sender::{EventSender, ReqwestEventSender, SendResult, DEFAULT_EVENTS_BASE_URI};
pub use summarizer::{CounterOut, FlagSummaryOut, SummaryOut};

/// Current wall-clock time in unix milliseconds, the timestamp unit used on
/// the event wire.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
