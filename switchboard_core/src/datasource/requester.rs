//! The HTTP snapshot requester used by the polling processor.
use reqwest::{header, StatusCode, Url};

use crate::{Error, Result, SdkMetadata};

use super::SnapshotData;

/// Default base URI of the polling endpoint.
pub const DEFAULT_POLLING_BASE_URI: &str = "https://app.launchdarkly.com";

const LATEST_ALL_PATH: &str = "/sdk/latest-all";

/// Fetches full flag/segment snapshots. The production implementation is
/// [`ReqwestFeatureRequester`]; tests script their own.
pub trait FeatureRequester: Send + 'static {
    fn get_all(&mut self) -> Result<SnapshotData>;
}

/// A snapshot requester backed by `reqwest`, driven synchronously on the
/// polling thread via a current-thread runtime.
pub struct ReqwestFeatureRequester {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    url: Url,
    sdk_key: String,
    user_agent: String,
    /// If we receive a 401/403 during a request, the SDK key is not valid. We
    /// cache this so we don't keep issuing requests to the server.
    unauthorized: bool,
}

impl ReqwestFeatureRequester {
    pub fn new(
        base_uri: &str,
        sdk_key: impl Into<String>,
        sdk_metadata: SdkMetadata,
    ) -> Result<ReqwestFeatureRequester> {
        let url = Url::parse(&format!("{}{}", base_uri.trim_end_matches('/'), LATEST_ALL_PATH))
            .map_err(Error::InvalidBaseUri)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(ReqwestFeatureRequester {
            client: reqwest::Client::new(),
            runtime,
            url,
            sdk_key: sdk_key.into(),
            user_agent: sdk_metadata.user_agent(),
            unauthorized: false,
        })
    }
}

impl FeatureRequester for ReqwestFeatureRequester {
    fn get_all(&mut self) -> Result<SnapshotData> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        let response = self.runtime.block_on(
            self.client
                .get(self.url.clone())
                .header(header::AUTHORIZATION, &self.sdk_key)
                .header(header::USER_AGENT, &self.user_agent)
                .send(),
        )?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "switchboard",
                    "polling request rejected; check your SDK key");
                self.unauthorized = true;
                return Err(Error::Unauthorized);
            }
            status => {
                log::warn!(target: "switchboard",
                    "received {status} while fetching flag snapshot");
                return Err(Error::UnexpectedStatus(status.as_u16()));
            }
        }

        let snapshot = self
            .runtime
            .block_on(response.json::<SnapshotData>())
            .map_err(|err| Error::MalformedPayload(err.to_string()))?;
        log::debug!(target: "switchboard", "successfully fetched flag snapshot");
        Ok(snapshot)
    }
}
