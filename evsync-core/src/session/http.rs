use super::AuthRepository;
use crate::api::ApiError;
use crate::entities::{Session, SessionId};
use async_trait::async_trait;
use evsync_sdk::client::{AuthClient, AuthHeaders};
use evsync_sdk::objects::auth::SessionTokens;

/// [`AuthRepository`] over the SDK auth client.
pub struct HttpAuthRepository {
    client: AuthClient,
}

impl HttpAuthRepository {
    pub fn new(client: AuthClient) -> Self {
        Self { client }
    }
}

fn into_session(tokens: SessionTokens, previous: Option<&Session>) -> Session {
    Session {
        session_id: SessionId::from(tokens.uid),
        user_id: previous.and_then(|s| s.user_id.clone()),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        scopes: tokens.scopes,
    }
}

#[async_trait]
impl AuthRepository for HttpAuthRepository {
    async fn request_session(&self) -> Result<Session, ApiError> {
        let tokens = self.client.create_session().await?;
        Ok(into_session(tokens, None))
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, ApiError> {
        let tokens = self
            .client
            .refresh_session(session.session_id.as_str(), &session.refresh_token)
            .await?;
        Ok(into_session(tokens, Some(session)))
    }

    async fn get_scopes(&self, session: &Session) -> Result<Vec<String>, ApiError> {
        let auth = AuthHeaders {
            uid: session.session_id.to_string(),
            access_token: session.access_token.clone(),
        };
        Ok(self.client.scopes(&auth).await?.scopes)
    }
}
