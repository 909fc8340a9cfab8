//! Aggregation of feature events into per-window summary counters.
use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::event::FeatureRequestEvent;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    version: Option<u64>,
    variation: Option<i64>,
}

#[derive(Debug, Clone)]
struct Counter {
    value: Option<Value>,
    count: u64,
}

#[derive(Debug, Default)]
struct FlagCounters {
    default: Option<Value>,
    counters: HashMap<CounterKey, Counter>,
}

/// Accumulates every feature event in the current flush window into one
/// summary event, which replaces most per-call feature events on the wire.
#[derive(Debug, Default)]
pub(crate) struct EventSummarizer {
    start_date: u64,
    end_date: u64,
    flags: HashMap<String, FlagCounters>,
}

impl EventSummarizer {
    pub fn new() -> EventSummarizer {
        EventSummarizer::default()
    }

    pub fn add(&mut self, event: &FeatureRequestEvent) {
        if self.start_date == 0 || event.creation_date < self.start_date {
            self.start_date = event.creation_date;
        }
        if event.creation_date > self.end_date {
            self.end_date = event.creation_date;
        }

        let flag = self.flags.entry(event.key.clone()).or_default();
        // Most recent default wins.
        flag.default = event.default.clone();
        let counter = flag
            .counters
            .entry(CounterKey {
                version: event.version,
                variation: event.variation,
            })
            .or_insert_with(|| Counter {
                value: event.value.clone(),
                count: 0,
            });
        counter.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Produce the summary for the window and reset for the next one.
    pub fn take(&mut self) -> Option<SummaryOut> {
        if self.is_empty() {
            return None;
        }
        let summarizer = std::mem::take(self);
        let features = summarizer
            .flags
            .into_iter()
            .map(|(key, flag)| {
                let counters = flag
                    .counters
                    .into_iter()
                    .map(|(counter_key, counter)| CounterOut {
                        value: counter.value,
                        version: counter_key.version,
                        variation: counter_key.variation,
                        count: counter.count,
                        unknown: counter_key.version.is_none().then_some(true),
                    })
                    .collect();
                (
                    key,
                    FlagSummaryOut {
                        default: flag.default,
                        counters,
                    },
                )
            })
            .collect();
        Some(SummaryOut {
            start_date: summarizer.start_date,
            end_date: summarizer.end_date,
            features,
        })
    }
}

/// Wire form of the summary event body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOut {
    pub start_date: u64,
    pub end_date: u64,
    pub features: HashMap<String, FlagSummaryOut>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummaryOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub counters: Vec<CounterOut>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown: Option<bool>,
}
