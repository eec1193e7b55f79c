use super::AccountManager;
use crate::entities::{Account, AccountState, Session, SessionId, SessionState, UserId};
use crate::repository::RepositoryError;
use crate::session::{AccountRepository, SessionProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const CHANGES_BUFFER: usize = 64;

/// Process-local accounts and sessions.
///
/// Every account mutation is published both on the per-user watch channel
/// and on the global change broadcast.
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<UserId, watch::Sender<Option<Account>>>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    changes: broadcast::Sender<Account>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGES_BUFFER);
        Self {
            accounts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Add or replace an account, storing its session alongside.
    pub fn add_account(&self, account: Account, session: Option<Session>) {
        if let Some(session) = session {
            self.sessions().insert(session.session_id.clone(), session);
        }
        self.publish(account);
    }

    pub fn remove_account(&self, user_id: &UserId) {
        if let Some(account) = self.modify(user_id, |a| a.state = AccountState::Removed)
            && let Some(session_id) = &account.session_id
        {
            self.sessions().remove(session_id);
        }
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.lock_accounts()
            .values()
            .filter_map(|tx| tx.borrow().clone())
            .collect()
    }

    fn lock_accounts(&self) -> MutexGuard<'_, HashMap<UserId, watch::Sender<Option<Account>>>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, account: Account) {
        debug!(user_id = %account.user_id, state = ?account.state, "Account changed");
        self.lock_accounts()
            .entry(account.user_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(account.clone()));
        // Nobody listening is fine.
        let _ = self.changes.send(account);
    }

    fn modify(&self, user_id: &UserId, f: impl FnOnce(&mut Account)) -> Option<Account> {
        let mut account = self
            .lock_accounts()
            .get(user_id)
            .and_then(|tx| tx.borrow().clone())?;
        f(&mut account);
        self.publish(account.clone());
        Some(account)
    }

    fn user_of_session(&self, session_id: &SessionId) -> Option<UserId> {
        self.lock_accounts().values().find_map(|tx| {
            tx.borrow()
                .as_ref()
                .filter(|a| a.session_id.as_ref() == Some(session_id))
                .map(|a| a.user_id.clone())
        })
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountManager for InMemoryAccountStore {
    async fn get_account(&self, user_id: &UserId) -> Option<Account> {
        self.lock_accounts()
            .get(user_id)
            .and_then(|tx| tx.borrow().clone())
    }

    fn observe_account(&self, user_id: &UserId) -> watch::Receiver<Option<Account>> {
        self.lock_accounts()
            .entry(user_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn on_account_state_changed(&self) -> broadcast::Receiver<Account> {
        self.changes.subscribe()
    }

    async fn disable_account(&self, user_id: &UserId) {
        let session_id = self
            .modify(user_id, |a| {
                a.state = AccountState::Disabled;
            })
            .and_then(|a| a.session_id);
        if let Some(session_id) = session_id {
            self.sessions().remove(&session_id);
        }
    }

    async fn update_account_state(&self, user_id: &UserId, state: AccountState) {
        self.modify(user_id, |a| a.state = state);
    }
}

#[async_trait]
impl SessionProvider for InMemoryAccountStore {
    async fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions().get(session_id).cloned()
    }

    async fn get_session_id(&self, user_id: Option<&UserId>) -> Option<SessionId> {
        match user_id {
            Some(user_id) => self
                .lock_accounts()
                .get(user_id)
                .and_then(|tx| tx.borrow().as_ref().and_then(|a| a.session_id.clone())),
            None => self
                .sessions()
                .values()
                .find(|s| !s.is_authenticated())
                .map(|s| s.session_id.clone()),
        }
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountStore {
    async fn create_or_update_session(&self, session: &Session) -> Result<(), RepositoryError> {
        self.sessions()
            .insert(session.session_id.clone(), session.clone());
        if let Some(user_id) = &session.user_id {
            let session_id = session.session_id.clone();
            self.modify(user_id, |a| a.session_id = Some(session_id));
        }
        Ok(())
    }

    async fn update_session_token(
        &self,
        session_id: &SessionId,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), RepositoryError> {
        if let Some(session) = self.sessions().get_mut(session_id) {
            session.access_token = access_token.to_string();
            session.refresh_token = refresh_token.to_string();
        }
        Ok(())
    }

    async fn update_session_scopes(
        &self,
        session_id: &SessionId,
        scopes: &[String],
    ) -> Result<(), RepositoryError> {
        if let Some(session) = self.sessions().get_mut(session_id) {
            session.scopes = scopes.to_vec();
        }
        Ok(())
    }

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> Result<(), RepositoryError> {
        if let Some(user_id) = self.user_of_session(session_id) {
            self.modify(&user_id, |a| a.session_state = Some(state));
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        self.sessions().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(user: &str, state: AccountState) -> Account {
        Account {
            user_id: UserId::from(user),
            username: user.into(),
            state,
            session_id: Some(SessionId::from(format!("session-{user}"))),
            session_state: Some(SessionState::Authenticated),
        }
    }

    #[tokio::test]
    async fn test_watchers_see_accounts_added_later() {
        let store = InMemoryAccountStore::new();
        let mut rx = store.observe_account(&UserId::from("u"));
        assert!(rx.borrow_and_update().is_none());

        store.add_account(account("u", AccountState::Ready), None);
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow_and_update().as_ref().map(|a| a.state),
            Some(AccountState::Ready)
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_broadcast() {
        let store = InMemoryAccountStore::new();
        store.add_account(account("u", AccountState::NotReady), None);
        let mut changes = store.on_account_state_changed();

        store
            .update_account_state(&UserId::from("u"), AccountState::Ready)
            .await;
        assert_eq!(changes.recv().await.unwrap().state, AccountState::Ready);
    }

    #[tokio::test]
    async fn test_disable_drops_session() {
        let store = InMemoryAccountStore::new();
        let session = Session {
            session_id: SessionId::from("session-u"),
            user_id: Some(UserId::from("u")),
            access_token: "a".into(),
            refresh_token: "r".into(),
            scopes: vec![],
        };
        store.add_account(account("u", AccountState::Ready), Some(session));
        assert!(store.get_session(&SessionId::from("session-u")).await.is_some());

        store.disable_account(&UserId::from("u")).await;
        assert!(store.get_session(&SessionId::from("session-u")).await.is_none());
        assert_eq!(
            store.get_account(&UserId::from("u")).await.map(|a| a.state),
            Some(AccountState::Disabled)
        );
    }
}
