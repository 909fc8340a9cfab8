use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

use switchboard_core::eval::Reason;

/// Options for [`crate::Client::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsOptions {
    /// Only include flags marked for client-side use.
    pub client_side_only: bool,
    /// Include an evaluation reason for every flag.
    pub with_reasons: bool,
    /// Omit version and reason metadata for flags that are neither tracked
    /// nor in their debug window, keeping the payload small.
    pub details_only_for_tracked_flags: bool,
}

impl AllFlagsOptions {
    pub fn new() -> AllFlagsOptions {
        AllFlagsOptions::default()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FlagState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "is_false")]
    pub track_events: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A snapshot of every flag's value and evaluation metadata for one user, in
/// the JSON shape expected by client-side SDK bootstrapping:
///
/// ```json
/// {"flag1": "value1", "$flagsState": {"flag1": {"version": 2, "variation": 0}}, "$valid": true}
/// ```
#[derive(Debug, Clone)]
pub struct FeatureFlagsState {
    valid: bool,
    values: BTreeMap<String, Value>,
    metadata: BTreeMap<String, FlagState>,
}

impl FeatureFlagsState {
    pub(crate) fn new() -> FeatureFlagsState {
        FeatureFlagsState {
            valid: true,
            values: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn invalid() -> FeatureFlagsState {
        FeatureFlagsState {
            valid: false,
            values: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn add_flag(&mut self, key: String, value: Option<Value>, state: FlagState) {
        self.values.insert(key.clone(), value.unwrap_or(Value::Null));
        self.metadata.insert(key, state);
    }

    /// False when the client was offline or had no flag data; the snapshot is
    /// then empty and must not be used for bootstrapping.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag, if present.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl Serialize for FeatureFlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 2))?;
        for (key, value) in &self.values {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("$flagsState", &self.metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}
