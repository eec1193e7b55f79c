//! Accounts and event streams declared in the configuration file.

use crate::config::file::AccountConfig;
use async_trait::async_trait;
use evsync_core::account::{AccountManager, InMemoryAccountStore};
use evsync_core::config::SettingsStore;
use evsync_core::entities::{
    Account, AccountState, EventManagerConfig, Session, SessionId, SessionState, UserId,
};
use evsync_core::processors::EventManagerConfigProvider;
use evsync_core::repository::RepositoryError;
use std::collections::HashSet;

/// Streams of a user: core plus every configured calendar and share.
pub struct ConfiguredStreams {
    accounts: SettingsStore<Vec<AccountConfig>>,
}

impl ConfiguredStreams {
    pub fn new(accounts: SettingsStore<Vec<AccountConfig>>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl EventManagerConfigProvider for ConfiguredStreams {
    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventManagerConfig>, RepositoryError> {
        let mut configs = vec![EventManagerConfig::core(user_id.clone())];
        let accounts = self.accounts.current();
        if let Some(account) = accounts.iter().find(|a| a.user_id == user_id.as_str()) {
            configs.extend(
                account
                    .calendars
                    .iter()
                    .map(|id| EventManagerConfig::calendar(user_id.clone(), id.clone())),
            );
            configs.extend(
                account
                    .shares
                    .iter()
                    .map(|id| EventManagerConfig::drive(user_id.clone(), id.clone())),
            );
        }
        Ok(configs)
    }
}

fn to_account(config: &AccountConfig) -> (Account, Session) {
    let user_id = UserId::from(config.user_id.clone());
    let session_id = SessionId::from(config.session_id.clone());
    let account = Account {
        user_id: user_id.clone(),
        username: config.username.clone(),
        state: AccountState::Ready,
        session_id: Some(session_id.clone()),
        session_state: Some(SessionState::Authenticated),
    };
    let session = Session {
        session_id,
        user_id: Some(user_id),
        access_token: config.access_token.clone(),
        refresh_token: config.refresh_token.clone(),
        scopes: Vec::new(),
    };
    (account, session)
}

/// Publish every configured account as ready.
pub fn publish_accounts(store: &InMemoryAccountStore, accounts: &[AccountConfig]) {
    for config in accounts {
        let (account, session) = to_account(config);
        store.add_account(account, Some(session));
    }
}

/// Bring the store in line with a reloaded account list.
///
/// Dropped accounts are removed, new ones are added, and kept ones are
/// republished as ready so their new streams get started. Sessions of kept
/// accounts are left alone since they may have been refreshed since.
pub async fn reconcile_accounts(
    store: &InMemoryAccountStore,
    previous: &[AccountConfig],
    next: &[AccountConfig],
) {
    let next_ids: HashSet<_> = next.iter().map(|a| &a.user_id).collect();
    for config in previous.iter().filter(|a| !next_ids.contains(&a.user_id)) {
        tracing::info!(user_id = %config.user_id, "Account removed from configuration");
        store.remove_account(&UserId::from(config.user_id.clone()));
    }

    for config in next {
        let user_id = UserId::from(config.user_id.clone());
        let known = previous.iter().any(|a| a.user_id == config.user_id)
            && store.get_account(&user_id).await.is_some();
        if known {
            store.update_account_state(&user_id, AccountState::Ready).await;
        } else {
            tracing::info!(user_id = %config.user_id, "Account added to configuration");
            let (account, session) = to_account(config);
            store.add_account(account, Some(session));
        }
    }
}
