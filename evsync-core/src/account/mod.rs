//! Account and app lifecycle collaborators.

mod memory;

pub use memory::InMemoryAccountStore;

use crate::entities::{Account, AccountState, UserId};
use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppLifecycleState {
    Foreground,
    Background,
}

/// Source of account state and the operations the engine triggers on it.
#[async_trait]
pub trait AccountManager: Send + Sync {
    async fn get_account(&self, user_id: &UserId) -> Option<Account>;

    /// Current account of `user_id`, updated on every change.
    fn observe_account(&self, user_id: &UserId) -> watch::Receiver<Option<Account>>;

    /// Every account change, for all users.
    fn on_account_state_changed(&self) -> broadcast::Receiver<Account>;

    /// Disable the account and drop its session.
    async fn disable_account(&self, user_id: &UserId);

    async fn update_account_state(&self, user_id: &UserId, state: AccountState);
}

pub trait AppLifecycleProvider: Send + Sync {
    fn state(&self) -> watch::Receiver<AppLifecycleState>;
}

/// Performs the account migration requested by `AccountState::MigrationNeeded`.
#[async_trait]
pub trait AccountMigrator: Send + Sync {
    async fn migrate(&self, user_id: &UserId) -> anyhow::Result<()>;
}

/// Settable [`AppLifecycleProvider`].
pub struct AppLifecycle {
    tx: watch::Sender<AppLifecycleState>,
}

impl AppLifecycle {
    pub fn new(initial: AppLifecycleState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: AppLifecycleState) {
        self.tx.send_replace(state);
    }

    pub fn current(&self) -> AppLifecycleState {
        *self.tx.borrow()
    }
}

impl AppLifecycleProvider for AppLifecycle {
    fn state(&self) -> watch::Receiver<AppLifecycleState> {
        self.tx.subscribe()
    }
}
