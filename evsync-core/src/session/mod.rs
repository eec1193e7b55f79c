//! Session collaborators used by the session manager and the HTTP binding.

mod http;

pub use http::HttpAuthRepository;

use crate::api::ApiError;
use crate::entities::{Session, SessionId, SessionState, UserId};
use crate::repository::RepositoryError;
use async_trait::async_trait;

/// Read access to stored sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, session_id: &SessionId) -> Option<Session>;

    /// Session of `user_id`, or the unauthenticated session for `None`.
    async fn get_session_id(&self, user_id: Option<&UserId>) -> Option<SessionId>;
}

/// Write access to stored sessions.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create_or_update_session(&self, session: &Session) -> Result<(), RepositoryError>;

    async fn update_session_token(
        &self,
        session_id: &SessionId,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), RepositoryError>;

    async fn update_session_scopes(
        &self,
        session_id: &SessionId,
        scopes: &[String],
    ) -> Result<(), RepositoryError>;

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> Result<(), RepositoryError>;

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), RepositoryError>;
}

/// Remote session operations.
#[async_trait]
pub trait AuthRepository: Send + Sync {
    /// Open a new unauthenticated session.
    async fn request_session(&self) -> Result<Session, ApiError>;

    /// Rotate the tokens of `session`.
    async fn refresh_session(&self, session: &Session) -> Result<Session, ApiError>;

    async fn get_scopes(&self, session: &Session) -> Result<Vec<String>, ApiError>;
}

/// Callbacks fired by the session manager.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_session_token_created(&self, _session: &Session) {}

    async fn on_session_token_refreshed(&self, _session: &Session) {}

    async fn on_session_force_logout(&self, _session: &Session, _http_code: u16) {}
}

/// Listener that ignores every callback.
pub struct NoopSessionListener;

#[async_trait]
impl SessionListener for NoopSessionListener {}
