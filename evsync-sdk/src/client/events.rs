use reqwest::Client;
use url::Url;

use super::{AuthHeaders, ClientBase, ClientError, text_response};

/// Typed HTTP client for the event stream endpoints.
///
/// Bodies are returned raw: the engine keeps the exact payload so listeners
/// can replay it across notification phases.
#[derive(Debug, Clone)]
pub struct EventsClient {
    base: ClientBase,
}

impl EventsClient {
    /// * `base_url` – API root (e.g. `https://mail.proton.me/api/`).
    pub fn new(base_url: Url) -> Self {
        Self {
            base: ClientBase::new(base_url),
        }
    }

    /// Replace the default `reqwest::Client` with a custom one (e.g. to
    /// configure timeouts or a proxy).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.base.http = client;
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.base.app_version = Some(version.into());
        self
    }

    /// `GET {endpoint}/latest` – the newest cursor of a stream.
    pub async fn latest_event_id(
        &self,
        auth: &AuthHeaders,
        endpoint: &str,
    ) -> Result<String, ClientError> {
        let url = self.base.url(&format!("{endpoint}/latest"))?;
        let resp = self.base.get(url, Some(auth)).send().await?;
        text_response(resp).await
    }

    /// `GET {endpoint}/{event_id}` – the batch following `event_id`.
    pub async fn events(
        &self,
        auth: &AuthHeaders,
        endpoint: &str,
        event_id: &str,
    ) -> Result<String, ClientError> {
        let url = self
            .base
            .url(&format!("{endpoint}/{}", urlencoding::encode(event_id)))?;
        let resp = self.base.get(url, Some(auth)).send().await?;
        text_response(resp).await
    }
}
