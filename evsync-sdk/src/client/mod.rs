//! HTTP clients for the event and auth APIs.
//!
//! Gated behind the `client` cargo feature so downstream crates that only
//! need the wire objects do not pull in `reqwest`.

mod auth;
mod events;

pub use auth::AuthClient;
pub use events::EventsClient;

use reqwest::{Client, RequestBuilder, StatusCode};
use url::Url;

use crate::objects::ApiErrorBody;

/// Header carrying the session id.
pub const UID_HEADER: &str = "x-pm-uid";
/// Header carrying the client application version.
pub const APP_VERSION_HEADER: &str = "x-pm-appversion";

/// Errors produced by the SDK HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (DNS, TLS, connection reset, …).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("api error: status {status}, code {code:?}: {message}")]
    Api {
        status: StatusCode,
        code: Option<i32>,
        message: String,
    },

    /// Response body could not be deserialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The base URL could not be joined with the endpoint path.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Credentials of an authenticated session.
#[derive(Clone)]
pub struct AuthHeaders {
    pub uid: String,
    pub access_token: String,
}

impl std::fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

/// State shared by every client: transport, API root and app version.
#[derive(Debug, Clone)]
struct ClientBase {
    http: Client,
    base_url: Url,
    app_version: Option<String>,
}

impl ClientBase {
    fn new(base_url: Url) -> Self {
        Self {
            http: Client::new(),
            base_url: with_trailing_slash(base_url),
            app_version: None,
        }
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    fn get(&self, url: Url, auth: Option<&AuthHeaders>) -> RequestBuilder {
        self.decorate(self.http.get(url), auth)
    }

    fn post(&self, url: Url, auth: Option<&AuthHeaders>) -> RequestBuilder {
        self.decorate(self.http.post(url), auth)
    }

    fn decorate(&self, mut request: RequestBuilder, auth: Option<&AuthHeaders>) -> RequestBuilder {
        if let Some(version) = &self.app_version {
            request = request.header(APP_VERSION_HEADER, version);
        }
        if let Some(auth) = auth {
            request = request
                .header(UID_HEADER, &auth.uid)
                .bearer_auth(&auth.access_token);
        }
        request
    }
}

/// `Url::join` drops the last path segment unless the base ends with `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

async fn error_from_response(resp: reqwest::Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => ClientError::Api {
            status,
            code: (parsed.code != 0).then_some(parsed.code),
            message: parsed.error,
        },
        Err(_) => ClientError::Api {
            status,
            code: None,
            message: body,
        },
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClientError> {
    let body = text_response(resp).await?;
    serde_json::from_str(&body).map_err(ClientError::Json)
}

async fn text_response(resp: reqwest::Response) -> Result<String, ClientError> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    Ok(resp.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_last_segment() {
        let base = ClientBase::new(Url::parse("https://mail.proton.me/api").unwrap());
        assert_eq!(
            base.url("core/v4/events/latest").unwrap().as_str(),
            "https://mail.proton.me/api/core/v4/events/latest"
        );
    }

    #[test]
    fn test_auth_headers_debug_hides_token() {
        let auth = AuthHeaders {
            uid: "uid".to_string(),
            access_token: "secret".to_string(),
        };
        assert!(!format!("{auth:?}").contains("secret"));
    }
}
