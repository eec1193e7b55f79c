//! Event stream API seam.
//!
//! [`EventApi`] is what the state machine calls; [`HttpEventApi`] binds it
//! to the SDK HTTP client.

mod http;

pub use http::HttpEventApi;

use crate::entities::{EventId, EventIdResponse, EventManagerConfig, EventsResponse, UserId};
use async_trait::async_trait;
use evsync_sdk::client::ClientError;
use thiserror::Error;

/// API codes telling the client it is too old to keep syncing.
pub const FORCE_UPDATE_CODES: [i32; 2] = [5003, 5005];

/// Errors returned by the remote API.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The server answered with a non-2xx status
    #[error("api error: status {status}, code {code:?}: {message}")]
    Http {
        status: u16,
        code: Option<i32>,
        message: String,
    },

    /// The request never reached the server
    #[error("connection error: {0}")]
    Connection(String),

    /// The request timed out
    #[error("request timed out")]
    Timeout,

    /// The response could not be read
    #[error("invalid response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_force_update(&self) -> bool {
        matches!(self, ApiError::Http { code: Some(code), .. } if FORCE_UPDATE_CODES.contains(code))
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Whether trying the same request again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Connection(_) | ApiError::Timeout => true,
            ApiError::Http { status, .. } => {
                matches!(status, 408 | 421 | 429) || (500..=599).contains(status)
            }
            ApiError::Parse(_) => false,
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Http(e) if e.is_timeout() => ApiError::Timeout,
            ClientError::Http(e) if e.is_decode() => ApiError::Parse(e.to_string()),
            ClientError::Http(e) => ApiError::Connection(e.to_string()),
            ClientError::Api {
                status,
                code,
                message,
            } => ApiError::Http {
                status: status.as_u16(),
                code,
                message,
            },
            ClientError::Json(e) => ApiError::Parse(e.to_string()),
            ClientError::Url(e) => ApiError::Parse(e.to_string()),
        }
    }
}

#[async_trait]
pub trait EventApi: Send + Sync {
    /// `GET {endpoint}/latest` on behalf of `user_id`.
    async fn get_latest_event_id(
        &self,
        user_id: &UserId,
        endpoint: &str,
    ) -> Result<EventIdResponse, ApiError>;

    /// `GET {endpoint}/{event_id}` for the stream of `config`.
    async fn get_events(
        &self,
        config: &EventManagerConfig,
        event_id: &EventId,
        endpoint: &str,
    ) -> Result<EventsResponse, ApiError>;
}
