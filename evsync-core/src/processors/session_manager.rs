//! Serialized session maintenance: creation, token refresh and scopes.

use crate::api::ApiError;
use crate::entities::{Session, SessionId, SessionState};
use crate::repository::RepositoryError;
use crate::session::{AccountRepository, AuthRepository, SessionListener, SessionProvider};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A session refreshed this recently is not refreshed again.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(60);

/// HTTP statuses meaning the refresh token is dead.
const FORCE_LOGOUT_STATUSES: [u16; 3] = [400, 401, 422];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Per-session locks and refresh timestamps.
///
/// The `None` key guards the unauthenticated session.
#[derive(Default)]
pub struct SessionLockRegistry {
    locks: Mutex<HashMap<Option<SessionId>, Arc<tokio::sync::Mutex<()>>>>,
    refreshed_at: Mutex<HashMap<SessionId, Instant>>,
}

impl SessionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session_id: Option<&SessionId>) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.cloned()).or_default())
    }

    fn refreshed_at(&self) -> MutexGuard<'_, HashMap<SessionId, Instant>> {
        self.refreshed_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refreshed_within(&self, session_id: &SessionId, window: Duration) -> bool {
        self.refreshed_at()
            .get(session_id)
            .is_some_and(|at| at.elapsed() < window)
    }

    fn record_refresh(&self, session_id: &SessionId) {
        self.refreshed_at().insert(session_id.clone(), Instant::now());
    }
}

pub struct SessionManager {
    sessions: Arc<dyn SessionProvider>,
    accounts: Arc<dyn AccountRepository>,
    auth: Arc<dyn AuthRepository>,
    listener: Arc<dyn SessionListener>,
    locks: Arc<SessionLockRegistry>,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        accounts: Arc<dyn AccountRepository>,
        auth: Arc<dyn AuthRepository>,
        listener: Arc<dyn SessionListener>,
        locks: Arc<SessionLockRegistry>,
    ) -> Self {
        Self {
            sessions,
            accounts,
            auth,
            listener,
            locks,
        }
    }

    /// Run `block` while holding the lock of `session_id`.
    pub async fn with_lock<F, R>(&self, session_id: Option<&SessionId>, block: F) -> R
    where
        F: Future<Output = R>,
    {
        let lock = self.locks.lock_for(session_id);
        let _guard = lock.lock().await;
        block.await
    }

    /// Make sure an unauthenticated session exists.
    pub async fn request_session(&self) -> Result<(), SessionError> {
        self.with_lock(None, self.request_session_locked()).await
    }

    /// Rotate the tokens of `session`.
    ///
    /// Returns `true` when the stored session holds usable tokens afterwards,
    /// including when another caller refreshed it first.
    pub async fn refresh_session(&self, session: &Session) -> Result<bool, SessionError> {
        self.with_lock(Some(&session.session_id), self.refresh_session_locked(session))
            .await
    }

    /// Fetch and store the current scopes of a session.
    pub async fn refresh_scopes(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.with_lock(Some(session_id), self.refresh_scopes_locked(session_id))
            .await
    }

    async fn request_session_locked(&self) -> Result<(), SessionError> {
        if let Some(session_id) = self.sessions.get_session_id(None).await
            && self.sessions.get_session(&session_id).await.is_some()
        {
            debug!(session_id = %session_id, "Unauthenticated session already exists");
            return Ok(());
        }
        let session = self.auth.request_session().await?;
        self.accounts.create_or_update_session(&session).await?;
        info!(session_id = %session.session_id, "Created unauthenticated session");
        self.listener.on_session_token_created(&session).await;
        Ok(())
    }

    async fn refresh_session_locked(&self, session: &Session) -> Result<bool, SessionError> {
        let session_id = &session.session_id;
        if self.locks.refreshed_within(session_id, REFRESH_DEBOUNCE) {
            debug!(session_id = %session_id, "Session refreshed recently, skipping");
            return Ok(true);
        }
        let Some(stored) = self.sessions.get_session(session_id).await else {
            return Ok(false);
        };
        if stored.refresh_token != session.refresh_token {
            debug!(session_id = %session_id, "Session already rotated");
            return Ok(true);
        }

        let error = match self.auth.refresh_session(&stored).await {
            Ok(refreshed) => {
                self.accounts
                    .update_session_token(session_id, &refreshed.access_token, &refreshed.refresh_token)
                    .await?;
                if !refreshed.scopes.is_empty() {
                    self.accounts
                        .update_session_scopes(session_id, &refreshed.scopes)
                        .await?;
                }
                self.locks.record_refresh(session_id);
                let refreshed = Session {
                    session_id: session_id.clone(),
                    user_id: stored.user_id.clone(),
                    ..refreshed
                };
                self.listener.on_session_token_refreshed(&refreshed).await;
                return Ok(true);
            }
            Err(e) => e,
        };

        let Some(status) = error
            .status()
            .filter(|status| FORCE_LOGOUT_STATUSES.contains(status))
        else {
            warn!(session_id = %session_id, error = %error, "Session refresh failed");
            return Ok(false);
        };

        warn!(session_id = %session_id, status, error = %error, "Refresh token rejected, forcing logout");
        self.accounts
            .update_session_state(session_id, SessionState::ForceLogout)
            .await?;
        self.accounts.delete_session(session_id).await?;
        self.listener.on_session_force_logout(&stored, status).await;
        if !stored.is_authenticated() {
            self.request_session().await?;
        }
        Ok(false)
    }

    async fn refresh_scopes_locked(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_session(session_id).await else {
            return Ok(());
        };
        let scopes = self.auth.get_scopes(&session).await?;
        self.accounts.update_session_scopes(session_id, &scopes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountManager, InMemoryAccountStore};
    use crate::entities::{Account, AccountState, UserId};
    use crate::testing::{FakeAuthRepository, RecordingSessionListener};

    struct Fixture {
        store: Arc<InMemoryAccountStore>,
        auth: Arc<FakeAuthRepository>,
        listener: Arc<RecordingSessionListener>,
        manager: Arc<SessionManager>,
    }

    fn session(id: &str, user: Option<&str>, refresh_token: &str) -> Session {
        Session {
            session_id: SessionId::from(id),
            user_id: user.map(UserId::from),
            access_token: "access".to_string(),
            refresh_token: refresh_token.to_string(),
            scopes: Vec::new(),
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryAccountStore::new());
        let auth = Arc::new(FakeAuthRepository::default());
        let listener = Arc::new(RecordingSessionListener::default());
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            auth.clone(),
            listener.clone(),
            Arc::new(SessionLockRegistry::new()),
        ));
        Fixture {
            store,
            auth,
            listener,
            manager,
        }
    }

    fn add_user(fixture: &Fixture, session: &Session) {
        fixture.store.add_account(
            Account {
                user_id: UserId::from("user"),
                username: "user".into(),
                state: AccountState::Ready,
                session_id: Some(session.session_id.clone()),
                session_state: Some(SessionState::Authenticated),
            },
            Some(session.clone()),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_stores_tokens_and_debounces() {
        let fixture = fixture();
        let session = session("s1", Some("user"), "r0");
        add_user(&fixture, &session);

        assert!(fixture.manager.refresh_session(&session).await.unwrap());
        assert!(fixture.manager.refresh_session(&session).await.unwrap());
        assert_eq!(fixture.auth.refresh_calls(), 1);

        let stored = fixture.store.get_session(&session.session_id).await.unwrap();
        assert_eq!(stored.refresh_token, "r1");
        assert_eq!(fixture.listener.events(), vec!["refreshed:s1"]);

        tokio::time::advance(REFRESH_DEBOUNCE).await;
        assert!(fixture.manager.refresh_session(&stored).await.unwrap());
        assert_eq!(fixture.auth.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_token_is_not_refreshed_again() {
        let fixture = fixture();
        let stored = session("s1", Some("user"), "current");
        add_user(&fixture, &stored);

        let stale = session("s1", Some("user"), "old");
        assert!(fixture.manager.refresh_session(&stale).await.unwrap());
        assert_eq!(fixture.auth.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_session_cannot_refresh() {
        let fixture = fixture();
        let unknown = session("gone", Some("user"), "r0");
        assert!(!fixture.manager.refresh_session(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_refresh_forces_logout() {
        for status in [400, 401, 422] {
            let fixture = fixture();
            let session = session("s1", Some("user"), "r0");
            add_user(&fixture, &session);
            fixture.auth.fail_refresh(ApiError::Http {
                status,
                code: None,
                message: "invalid refresh token".into(),
            });

            assert!(!fixture.manager.refresh_session(&session).await.unwrap());

            assert!(fixture.store.get_session(&session.session_id).await.is_none());
            let account = fixture.store.get_account(&UserId::from("user")).await.unwrap();
            assert_eq!(account.session_state, Some(SessionState::ForceLogout));
            assert_eq!(fixture.listener.events(), vec![format!("logout:s1:{status}")]);
        }
    }

    #[tokio::test]
    async fn test_transient_refresh_error_keeps_session() {
        let fixture = fixture();
        let session = session("s1", Some("user"), "r0");
        add_user(&fixture, &session);
        fixture.auth.fail_refresh(ApiError::Timeout);

        assert!(!fixture.manager.refresh_session(&session).await.unwrap());
        assert!(fixture.store.get_session(&session.session_id).await.is_some());
        assert!(fixture.listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_logout_requests_new_session() {
        let fixture = fixture();
        let anonymous = session("anon", None, "r0");
        fixture
            .store
            .create_or_update_session(&anonymous)
            .await
            .unwrap();
        fixture.auth.fail_refresh(ApiError::Http {
            status: 401,
            code: None,
            message: String::new(),
        });

        assert!(!fixture.manager.refresh_session(&anonymous).await.unwrap());

        assert_eq!(
            fixture.listener.events(),
            vec!["logout:anon:401".to_string(), "created:new-session".to_string()]
        );
        let session_id = fixture.store.get_session_id(None).await.unwrap();
        assert_eq!(session_id, SessionId::from("new-session"));
    }

    #[tokio::test]
    async fn test_request_session_is_skipped_when_present() {
        let fixture = fixture();
        fixture.manager.request_session().await.unwrap();
        fixture.manager.request_session().await.unwrap();
        assert_eq!(fixture.auth.request_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_scopes_are_stored() {
        let fixture = fixture();
        let session = session("s1", Some("user"), "r0");
        add_user(&fixture, &session);

        fixture.manager.refresh_scopes(&session.session_id).await.unwrap();

        let stored = fixture.store.get_session(&session.session_id).await.unwrap();
        assert_eq!(stored.scopes, vec!["full".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_work_is_serialized() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fixture = fixture();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = ["s1", "s1", "s1", "s2"]
            .into_iter()
            .map(|id| {
                let manager = fixture.manager.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let id = SessionId::from(id);
                    manager
                        .with_lock(Some(&id), async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // Only the two distinct sessions may overlap.
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_hit_the_api_once() {
        let fixture = fixture();
        let session = session("s1", Some("user"), "r0");
        add_user(&fixture, &session);
        fixture.auth.set_latency(Duration::from_millis(100));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = fixture.manager.clone();
                let session = session.clone();
                tokio::spawn(async move { manager.refresh_session(&session).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        assert_eq!(fixture.auth.refresh_calls(), 1);
    }
}
