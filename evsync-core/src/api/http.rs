use super::{ApiError, EventApi};
use crate::entities::{EventId, EventIdResponse, EventManagerConfig, EventsResponse, Session, UserId};
use crate::processors::{SessionError, SessionManager};
use crate::session::SessionProvider;
use async_trait::async_trait;
use evsync_sdk::client::{AuthHeaders, EventsClient};
use std::sync::Arc;
use tracing::{debug, warn};

/// [`EventApi`] over HTTP, authenticated with the user's stored session.
///
/// With a [`SessionManager`] attached, a 401 refreshes the session once and
/// replays the request.
pub struct HttpEventApi {
    client: EventsClient,
    sessions: Arc<dyn SessionProvider>,
    session_manager: Option<Arc<SessionManager>>,
}

/// Whether a refresh left a new token to retry with.
fn session_refreshed(user_id: &UserId, outcome: Result<bool, SessionError>) -> bool {
    match outcome {
        Ok(refreshed) => refreshed,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Session refresh failed, keeping the 401");
            false
        }
    }
}

enum Request<'a> {
    Latest { endpoint: &'a str },
    Events { endpoint: &'a str, event_id: &'a EventId },
}

impl HttpEventApi {
    pub fn new(client: EventsClient, sessions: Arc<dyn SessionProvider>) -> Self {
        Self {
            client,
            sessions,
            session_manager: None,
        }
    }

    pub fn with_session_manager(mut self, session_manager: Arc<SessionManager>) -> Self {
        self.session_manager = Some(session_manager);
        self
    }

    async fn session_for(&self, user_id: &UserId) -> Result<Session, ApiError> {
        let session = match self.sessions.get_session_id(Some(user_id)).await {
            Some(session_id) => self.sessions.get_session(&session_id).await,
            None => None,
        };
        session.ok_or_else(|| ApiError::Http {
            status: 401,
            code: None,
            message: format!("no session for user {user_id}"),
        })
    }

    async fn send(&self, session: &Session, request: &Request<'_>) -> Result<String, ApiError> {
        let auth = AuthHeaders {
            uid: session.session_id.to_string(),
            access_token: session.access_token.clone(),
        };
        let body = match request {
            Request::Latest { endpoint } => self.client.latest_event_id(&auth, endpoint).await?,
            Request::Events { endpoint, event_id } => {
                self.client
                    .events(&auth, endpoint, event_id.as_str())
                    .await?
            }
        };
        Ok(body)
    }

    async fn execute(&self, user_id: &UserId, request: Request<'_>) -> Result<String, ApiError> {
        let session = self.session_for(user_id).await?;
        let result = self.send(&session, &request).await;
        let Some(manager) = &self.session_manager else {
            return result;
        };
        match result {
            Err(error) if error.is_unauthorized() => {
                debug!(user_id = %user_id, "Unauthorized event request, refreshing session");
                if !session_refreshed(user_id, manager.refresh_session(&session).await) {
                    return Err(error);
                }
                let refreshed = self.session_for(user_id).await?;
                self.send(&refreshed, &request).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl EventApi for HttpEventApi {
    async fn get_latest_event_id(
        &self,
        user_id: &UserId,
        endpoint: &str,
    ) -> Result<EventIdResponse, ApiError> {
        let body = self.execute(user_id, Request::Latest { endpoint }).await?;
        Ok(EventIdResponse { body })
    }

    async fn get_events(
        &self,
        config: &EventManagerConfig,
        event_id: &EventId,
        endpoint: &str,
    ) -> Result<EventsResponse, ApiError> {
        let body = self
            .execute(config.user_id(), Request::Events { endpoint, event_id })
            .await?;
        Ok(EventsResponse { body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryError;

    #[test]
    fn test_failed_refresh_keeps_original_error() {
        let user = UserId::from("user");
        assert!(session_refreshed(&user, Ok(true)));
        assert!(!session_refreshed(&user, Ok(false)));
        assert!(!session_refreshed(
            &user,
            Err(SessionError::Repository(RepositoryError::Unavailable(
                "down".to_string()
            )))
        ));
        assert!(!session_refreshed(&user, Err(SessionError::Api(ApiError::Timeout))));
    }
}
