//! Processors of the sync engine.
//!
//! - `EventManager`: drives one event stream through its batch phases
//! - `EventManagerProvider`: owns one manager per config, receives `ProcessTick`
//! - `EventWorkerScheduler` / `EventWorkerRunner`: emit and consume `ProcessTick`
//! - `SessionManager`: serializes session creation and token refresh
//! - `AccountStateHandler`: receives account changes, starts and stops managers

pub mod account_state;
pub mod event_manager;
pub mod provider;
pub mod session_manager;
pub mod worker;

pub use account_state::AccountStateHandler;
pub use event_manager::{
    EventManager, EventManagerDeps, EventManagerError, NextAction, Phase,
    RETRIES_BEFORE_DELETE_ALL_METADATA, RETRIES_BEFORE_NOTIFY_FAILURE,
    RETRIES_BEFORE_NOTIFY_RESET_ALL,
};
pub use provider::{EventManagerConfigProvider, EventManagerProvider, RepositoryConfigProvider};
pub use session_manager::{REFRESH_DEBOUNCE, SessionError, SessionLockRegistry, SessionManager};
pub use worker::{EventWorkerManager, EventWorkerRunner, EventWorkerScheduler};
