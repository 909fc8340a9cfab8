//! Delivery of event payloads to the control plane.
use chrono::DateTime;
use reqwest::{header, StatusCode, Url};
use uuid::Uuid;

use crate::{Error, Result, SdkMetadata};

use super::OutputEvent;

/// Default base URI of the events service.
pub const DEFAULT_EVENTS_BASE_URI: &str = "https://events.launchdarkly.com";

const BULK_PATH: &str = "/bulk";
const DIAGNOSTIC_PATH: &str = "/diagnostic";

/// The event schema version sent in `X-LaunchDarkly-Event-Schema`.
const EVENT_SCHEMA_VERSION: &str = "3";

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendResult {
    pub success: bool,
    /// The service rejected our credentials; stop sending permanently.
    pub must_shutdown: bool,
    /// Server time from the response `Date` header, in unix milliseconds.
    pub server_time: Option<u64>,
}

/// Delivers serialized event payloads. The production implementation is
/// [`ReqwestEventSender`]; tests record payloads instead.
pub trait EventSender: Send + Sync + 'static {
    fn send_analytics(&self, events: &[OutputEvent]) -> SendResult;
    fn send_diagnostic(&self, event: &serde_json::Value) -> SendResult;
}

/// An event sender backed by `reqwest`.
///
/// Analytics posts carry the schema version header and a per-payload UUID so
/// the service can deduplicate the single immediate retry performed on
/// transient failures.
pub struct ReqwestEventSender {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    bulk_url: Url,
    diagnostic_url: Url,
    sdk_key: String,
    user_agent: String,
}

impl ReqwestEventSender {
    pub fn new(
        base_uri: &str,
        sdk_key: impl Into<String>,
        sdk_metadata: SdkMetadata,
    ) -> Result<ReqwestEventSender> {
        let base = base_uri.trim_end_matches('/');
        let bulk_url =
            Url::parse(&format!("{base}{BULK_PATH}")).map_err(Error::InvalidBaseUri)?;
        let diagnostic_url =
            Url::parse(&format!("{base}{DIAGNOSTIC_PATH}")).map_err(Error::InvalidBaseUri)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(ReqwestEventSender {
            client,
            runtime,
            bulk_url,
            diagnostic_url,
            sdk_key: sdk_key.into(),
            user_agent: sdk_metadata.user_agent(),
        })
    }

    fn post(&self, url: &Url, body: &serde_json::Value, payload_id: Option<&str>) -> SendResult {
        // One immediate retry on transient failure, with the same payload ID.
        for attempt in 0..2 {
            let mut request = self
                .client
                .post(url.clone())
                .header(header::AUTHORIZATION, &self.sdk_key)
                .header(header::USER_AGENT, &self.user_agent)
                .json(body);
            if let Some(payload_id) = payload_id {
                request = request
                    .header("X-LaunchDarkly-Event-Schema", EVENT_SCHEMA_VERSION)
                    .header("X-LaunchDarkly-Payload-ID", payload_id);
            }

            match self.runtime.block_on(request.send()) {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return SendResult {
                            success: true,
                            must_shutdown: false,
                            server_time: server_time_from(&response),
                        };
                    }
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        log::error!(target: "switchboard",
                            "event delivery rejected ({status}); disabling event sending");
                        return SendResult {
                            success: false,
                            must_shutdown: true,
                            server_time: None,
                        };
                    }
                    log::warn!(target: "switchboard",
                        "event delivery failed with {status} (attempt {})", attempt + 1);
                }
                Err(error) => {
                    log::warn!(target: "switchboard",
                        "event delivery failed: {error} (attempt {})", attempt + 1);
                }
            }
        }
        SendResult::default()
    }
}

fn server_time_from(response: &reqwest::Response) -> Option<u64> {
    let date = response.headers().get(header::DATE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(date)
        .ok()
        .map(|t| t.timestamp_millis() as u64)
}

impl EventSender for ReqwestEventSender {
    fn send_analytics(&self, events: &[OutputEvent]) -> SendResult {
        let body = match serde_json::to_value(events) {
            Ok(body) => body,
            Err(error) => {
                log::error!(target: "switchboard", "dropping unserializable events: {error}");
                return SendResult::default();
            }
        };
        let payload_id = Uuid::new_v4().to_string();
        log::debug!(target: "switchboard", "delivering {} events", events.len());
        self.post(&self.bulk_url, &body, Some(&payload_id))
    }

    fn send_diagnostic(&self, event: &serde_json::Value) -> SendResult {
        self.post(&self.diagnostic_url, event, None)
    }
}
