use reqwest::Client;
use url::Url;

use super::{AuthHeaders, ClientBase, ClientError, UID_HEADER, parse_response};
use crate::objects::auth::{RefreshSessionRequest, ScopesResponse, SessionTokens};

/// Typed HTTP client for the session endpoints.
#[derive(Debug, Clone)]
pub struct AuthClient {
    base: ClientBase,
}

impl AuthClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base: ClientBase::new(base_url),
        }
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.base.http = client;
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.base.app_version = Some(version.into());
        self
    }

    /// `POST auth/v4/sessions` – open an unauthenticated session.
    pub async fn create_session(&self) -> Result<SessionTokens, ClientError> {
        let url = self.base.url("auth/v4/sessions")?;
        let resp = self.base.post(url, None).send().await?;
        parse_response(resp).await
    }

    /// `POST auth/v4/refresh` – rotate the tokens of session `uid`.
    pub async fn refresh_session(
        &self,
        uid: &str,
        refresh_token: &str,
    ) -> Result<SessionTokens, ClientError> {
        let url = self.base.url("auth/v4/refresh")?;
        let resp = self
            .base
            .post(url, None)
            .header(UID_HEADER, uid)
            .json(&RefreshSessionRequest::new(refresh_token))
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `GET auth/v4/scopes`
    pub async fn scopes(&self, auth: &AuthHeaders) -> Result<ScopesResponse, ClientError> {
        let url = self.base.url("auth/v4/scopes")?;
        let resp = self.base.get(url, Some(auth)).send().await?;
        parse_response(resp).await
    }
}
