//! Diagnostic event records, a stream entirely separable from analytics.
use serde_json::{json, Value};
use uuid::Uuid;

use crate::SdkMetadata;

use super::now_millis;

/// Builds the "diagnostic-init" record sent once at startup and the periodic
/// counter records sent on the diagnostic interval.
pub(crate) struct DiagnosticsManager {
    id: Value,
    sdk: SdkMetadata,
    data_since: u64,
}

impl DiagnosticsManager {
    pub fn new(sdk_key: &str, sdk: SdkMetadata) -> DiagnosticsManager {
        let suffix: String = sdk_key
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        DiagnosticsManager {
            id: json!({
                "diagnosticId": Uuid::new_v4().to_string(),
                "sdkKeySuffix": suffix,
            }),
            sdk,
            data_since: now_millis(),
        }
    }

    pub fn init_event(&self) -> Value {
        json!({
            "kind": "diagnostic-init",
            "id": self.id,
            "creationDate": self.data_since,
            "sdk": {
                "name": self.sdk.name,
                "version": self.sdk.version,
            },
            "platform": {
                "name": "rust",
                "osArch": std::env::consts::ARCH,
                "osName": std::env::consts::OS,
            },
        })
    }

    pub fn periodic_event(
        &mut self,
        dropped_events: u64,
        deduplicated_users: u64,
        events_in_last_batch: u64,
    ) -> Value {
        let now = now_millis();
        let event = json!({
            "kind": "diagnostic-periodic",
            "id": self.id,
            "creationDate": now,
            "dataSinceDate": self.data_since,
            "droppedEvents": dropped_events,
            "deduplicatedUsers": deduplicated_users,
            "eventsInLastBatch": events_in_last_batch,
        });
        self.data_since = now;
        event
    }
}
