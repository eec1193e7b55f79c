//! Reacts to account changes by starting, stopping and cleaning up managers.

use super::provider::EventManagerProvider;
use crate::account::{AccountManager, AccountMigrator};
use crate::entities::{Account, AccountState, SessionState, UserId};
use kanau::processor::Processor;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

pub struct AccountStateHandler {
    accounts: Arc<dyn AccountManager>,
    provider: Arc<EventManagerProvider>,
    migrator: Option<Arc<dyn AccountMigrator>>,
}

impl AccountStateHandler {
    pub fn new(accounts: Arc<dyn AccountManager>, provider: Arc<EventManagerProvider>) -> Self {
        Self {
            accounts,
            provider,
            migrator: None,
        }
    }

    pub fn with_migrator(mut self, migrator: Arc<dyn AccountMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Run until shutdown is signaled or the account stream closes.
    ///
    /// Subscribe `changes` before publishing the initial accounts so none
    /// of them is missed.
    pub async fn run(
        self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut changes: broadcast::Receiver<Account>,
    ) {
        info!("AccountStateHandler started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("AccountStateHandler received shutdown signal");
                        break;
                    }
                }

                received = changes.recv() => match received {
                    Ok(account) => {
                        let _ = self.process(account).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "AccountStateHandler lagged behind account changes");
                    }
                    Err(RecvError::Closed) => {
                        info!("Account change channel closed");
                        break;
                    }
                },
            }
        }

        info!("AccountStateHandler shutdown complete");
    }

    async fn start_all(&self, user_id: &UserId) {
        match self.provider.get_all(user_id).await {
            Ok(managers) => {
                for manager in managers {
                    manager.start().await;
                }
            }
            Err(e) => error!(user_id = %user_id, error = %e, "Failed to resolve event managers"),
        }
    }

    async fn stop_all(&self, user_id: &UserId, delete_metadata: bool) {
        let managers = match self.provider.get_all(user_id).await {
            Ok(managers) => managers,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to resolve event managers");
                return;
            }
        };
        for manager in managers {
            manager.stop().await;
            if delete_metadata && let Err(e) = manager.delete_all_metadata().await {
                error!(config = %manager.config(), error = %e, "Failed to delete event metadata");
            }
        }
    }

    async fn migrate(&self, user_id: &UserId) {
        let Some(migrator) = &self.migrator else {
            warn!(user_id = %user_id, "Account needs migration but no migrator is configured");
            self.accounts.disable_account(user_id).await;
            return;
        };
        match migrator.migrate(user_id).await {
            Ok(()) => {
                info!(user_id = %user_id, "Account migrated");
                self.accounts
                    .update_account_state(user_id, AccountState::Ready)
                    .await;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Account migration failed, disabling");
                self.accounts.disable_account(user_id).await;
            }
        }
    }
}

impl Processor<Account> for AccountStateHandler {
    type Output = ();
    type Error = Infallible;

    async fn process(&self, account: Account) -> Result<(), Infallible> {
        let user_id = &account.user_id;
        debug!(user_id = %user_id, state = ?account.state, session_state = ?account.session_state, "Account changed");

        let disabled = matches!(account.state, AccountState::Disabled | AccountState::Removed);
        if account.session_state == Some(SessionState::ForceLogout) && !disabled {
            info!(user_id = %user_id, "Session forced out, disabling account");
            self.accounts.disable_account(user_id).await;
            return Ok(());
        }

        match account.state {
            AccountState::Ready => self.start_all(user_id).await,
            AccountState::Disabled => self.stop_all(user_id, false).await,
            AccountState::Removed => self.stop_all(user_id, true).await,
            AccountState::UserKeyCheckFailed | AccountState::UserAddressKeyCheckFailed => {
                warn!(user_id = %user_id, state = ?account.state, "Key check failed, disabling account");
                self.accounts.disable_account(user_id).await;
            }
            AccountState::MigrationNeeded => self.migrate(user_id).await,
            AccountState::NotReady | AccountState::UnlockFailed => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EventManagerConfig, EventMetadata, State};
    use crate::processors::RepositoryConfigProvider;
    use crate::repository::EventMetadataRepository;
    use crate::testing::Harness;
    use async_trait::async_trait;

    struct FailingMigrator;

    #[async_trait]
    impl AccountMigrator for FailingMigrator {
        async fn migrate(&self, _user_id: &UserId) -> anyhow::Result<()> {
            anyhow::bail!("keys unavailable")
        }
    }

    struct NoopMigrator;

    #[async_trait]
    impl AccountMigrator for NoopMigrator {
        async fn migrate(&self, _user_id: &UserId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn handler(harness: &Harness) -> (AccountStateHandler, Arc<EventManagerProvider>) {
        let provider = Arc::new(EventManagerProvider::new(
            harness.deps.clone(),
            Arc::new(RepositoryConfigProvider::new(harness.deps.repository.clone())),
            Vec::new(),
        ));
        let handler = AccountStateHandler::new(harness.accounts.clone(), provider.clone());
        (handler, provider)
    }

    async fn account(harness: &Harness) -> Account {
        harness.accounts.get_account(&UserId::from("user")).await.unwrap()
    }

    #[tokio::test]
    async fn test_ready_starts_and_disabled_stops() {
        let harness = Harness::new().await;
        let (handler, provider) = handler(&harness);

        handler.process(account(&harness).await).await.unwrap();
        let manager = provider.get(&EventManagerConfig::core(UserId::from("user")));
        assert!(manager.is_started().await);

        harness.set_account_state(AccountState::Disabled).await;
        handler.process(account(&harness).await).await.unwrap();
        assert!(!manager.is_started().await);
    }

    #[tokio::test]
    async fn test_run_reacts_until_shutdown() {
        let harness = Harness::new().await;
        let (handler, provider) = handler(&harness);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let changes = harness.accounts.on_account_state_changed();
        let task = tokio::spawn(handler.run(shutdown_rx, changes));

        harness.set_account_state(AccountState::Ready).await;
        let manager = provider.get(&EventManagerConfig::core(UserId::from("user")));
        for _ in 0..50 {
            if manager.is_started().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(manager.is_started().await);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_removed_account_loses_metadata() {
        let harness = Harness::new().await;
        let (handler, _provider) = handler(&harness);
        let config = EventManagerConfig::core(UserId::from("user"));
        harness
            .repository
            .update_metadata(&EventMetadata::new(config.clone()).with_state(State::Completed))
            .await
            .unwrap();

        harness.accounts.remove_account(&UserId::from("user"));
        handler.process(account(&harness).await).await.unwrap();

        assert!(harness.repository.get(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_logout_disables_account() {
        let harness = Harness::new().await;
        let (handler, _provider) = handler(&harness);
        let mut forced = account(&harness).await;
        forced.session_state = Some(SessionState::ForceLogout);

        handler.process(forced).await.unwrap();

        assert_eq!(account(&harness).await.state, AccountState::Disabled);
    }

    #[tokio::test]
    async fn test_key_check_failure_disables_account() {
        let harness = Harness::new().await;
        let (handler, _provider) = handler(&harness);
        harness
            .set_account_state(AccountState::UserAddressKeyCheckFailed)
            .await;

        handler.process(account(&harness).await).await.unwrap();

        assert_eq!(account(&harness).await.state, AccountState::Disabled);
    }

    #[tokio::test]
    async fn test_migration_outcome() {
        let harness = Harness::new().await;
        let (handler, _provider) = handler(&harness);
        let handler = handler.with_migrator(Arc::new(NoopMigrator));
        harness.set_account_state(AccountState::MigrationNeeded).await;
        handler.process(account(&harness).await).await.unwrap();
        assert_eq!(account(&harness).await.state, AccountState::Ready);

        let (handler, _provider) = self::handler(&harness);
        let handler = handler.with_migrator(Arc::new(FailingMigrator));
        harness.set_account_state(AccountState::MigrationNeeded).await;
        handler.process(account(&harness).await).await.unwrap();
        assert_eq!(account(&harness).await.state, AccountState::Disabled);
    }
}
