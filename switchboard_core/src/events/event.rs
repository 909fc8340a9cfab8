//! Analytics events: the kinds accepted from the client, and the wire forms
//! delivered to the control plane.
use serde::Serialize;
use serde_json::Value;

use crate::eval::Reason;
use crate::User;

/// One flag evaluation, as fed into the pipeline. Every one of these
/// contributes to the flush window's summary; it is additionally delivered in
/// full when tracking or debugging applies.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequestEvent {
    pub creation_date: u64,
    pub key: String,
    pub user: User,
    /// Flag version; `None` when the flag was unknown.
    pub version: Option<u64>,
    pub variation: Option<i64>,
    pub value: Option<Value>,
    pub default: Option<Value>,
    pub reason: Option<Reason>,
    /// Set when this evaluation happened as a prerequisite of another flag.
    pub prereq_of: Option<String>,
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyEvent {
    pub creation_date: u64,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub creation_date: u64,
    pub key: String,
    pub user: User,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
}

/// An event accepted by [`super::EventProcessor::send_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
}

impl Event {
    pub(crate) fn user(&self) -> &User {
        match self {
            Event::FeatureRequest(e) => &e.user,
            Event::Identify(e) => &e.user,
            Event::Custom(e) => &e.user,
        }
    }
}

/// Wire form of a feature or debug event. Depending on configuration the user
/// is inlined or reduced to its key; debug events always inline the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEventOut {
    pub creation_date: u64,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl FeatureEventOut {
    pub fn from_event(event: &FeatureRequestEvent, inline_user: bool) -> FeatureEventOut {
        FeatureEventOut {
            creation_date: event.creation_date,
            key: event.key.clone(),
            user: inline_user.then(|| event.user.clone()),
            user_key: (!inline_user).then(|| event.user.key().to_owned()),
            version: event.version,
            variation: event.variation,
            value: event.value.clone(),
            default: event.default.clone(),
            prereq_of: event.prereq_of.clone(),
            reason: event.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyEventOut {
    pub creation_date: u64,
    pub key: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEventOut {
    pub creation_date: u64,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEventOut {
    pub creation_date: u64,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
}

/// An event in its deliverable form. The `kind` tag is part of the wire
/// schema.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutputEvent {
    Feature(FeatureEventOut),
    Debug(FeatureEventOut),
    Identify(IdentifyEventOut),
    Index(IndexEventOut),
    Custom(CustomEventOut),
    Summary(super::summarizer::SummaryOut),
}
