//! Per-config synchronization state machine.
//!
//! One [`EventManager`] drives one event stream. Every step of a batch is
//! persisted before it runs, so a crashed or cancelled process resumes from
//! the last recorded [`State`] on the next [`EventManager::process`].

use super::worker::EventWorkerManager;
use crate::account::{AccountManager, AppLifecycleProvider, AppLifecycleState};
use crate::api::{ApiError, EventApi};
use crate::config::{EngineSettings, SettingsStore};
use crate::deserializer::EventDeserializer;
use crate::entities::{AccountState, EventId, EventManagerConfig, EventMetadata, RefreshType, State};
use crate::listener::EventListener;
use crate::repository::{EventMetadataRepository, RepositoryError, current_metadata};
use crate::utils::fetch_interval::fetch_throttle_remaining;
use futures_util::FutureExt;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Past this many failed attempts a batch is reported and its failure
/// listeners run.
pub const RETRIES_BEFORE_NOTIFY_FAILURE: u32 = 3;
/// Past this many, listeners are asked to rebuild from scratch.
pub const RETRIES_BEFORE_NOTIFY_RESET_ALL: u32 = 6;
/// Past this many, the config's metadata is dropped and sync restarts.
pub const RETRIES_BEFORE_DELETE_ALL_METADATA: u32 = 9;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(200);

/// What the worker should do after a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Enqueue { immediately: bool },
    Stop,
    None,
}

/// Listener notification phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Events,
    Success,
    Failure,
    ResetAll,
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Prepare => "prepare",
            Phase::Events => "events",
            Phase::Success => "success",
            Phase::Failure => "failure",
            Phase::ResetAll => "reset_all",
            Phase::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EventManagerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to deserialize event response: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("listener with order {order} failed during {phase}: {error:#}")]
    Listener {
        phase: Phase,
        order: i32,
        error: anyhow::Error,
    },
}

/// Collaborators shared by every manager of a provider.
#[derive(Clone)]
pub struct EventManagerDeps {
    pub repository: Arc<dyn EventMetadataRepository>,
    pub api: Arc<dyn EventApi>,
    pub worker: Arc<dyn EventWorkerManager>,
    pub accounts: Arc<dyn AccountManager>,
    pub app_lifecycle: Arc<dyn AppLifecycleProvider>,
    pub settings: SettingsStore<EngineSettings>,
}

type ListenersByOrder = BTreeMap<i32, SmallVec<[Arc<dyn EventListener>; 2]>>;

pub struct EventManager {
    config: EventManagerConfig,
    deserializer: Box<dyn EventDeserializer>,
    deps: EventManagerDeps,
    listeners: RwLock<ListenersByOrder>,
    /// Observer task; `Some` while started.
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    processing: Mutex<()>,
}

impl EventManager {
    pub fn new(deserializer: Box<dyn EventDeserializer>, deps: EventManagerDeps) -> Self {
        Self {
            config: deserializer.config().clone(),
            deserializer,
            deps,
            listeners: RwLock::new(BTreeMap::new()),
            lifecycle: Mutex::new(None),
            processing: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    /// Add a listener. Subscribing the same instance twice has no effect.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let rank = listeners.entry(listener.order()).or_default();
        if !rank.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            rank.push(listener);
        }
    }

    /// Listeners flattened in ascending order.
    fn listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Advance the current batch of this config as far as possible.
    pub async fn process(&self) -> Result<(), EventManagerError> {
        let _processing = self.processing.lock().await;
        let records = self.deps.repository.get(&self.config).await?;
        let last_fetched_at = records.iter().filter_map(|m| m.fetched_at).max();
        let Some(metadata) = current_metadata(&records).cloned() else {
            debug!(config = %self.config, "No event metadata, nothing to process");
            return Ok(());
        };
        self.dispatch(metadata, last_fetched_at).await
    }

    async fn dispatch(
        &self,
        metadata: EventMetadata,
        last_fetched_at: Option<OffsetDateTime>,
    ) -> Result<(), EventManagerError> {
        // A completed batch was fully applied; it only moves the chain on.
        match (metadata.state, metadata.retry) {
            (State::Completed, _) => {
                self.reschedule(true, false).await;
                Ok(())
            }
            (_, retry) if retry > RETRIES_BEFORE_DELETE_ALL_METADATA => {
                self.report_failure(&metadata);
                self.deps.repository.delete_all(&self.config).await?;
                self.reschedule(true, false).await;
                Ok(())
            }
            (_, retry) if retry > RETRIES_BEFORE_NOTIFY_RESET_ALL => {
                self.report_failure(&metadata);
                self.notify_reset_all(metadata).await
            }
            (_, retry) if retry > RETRIES_BEFORE_NOTIFY_FAILURE => {
                self.report_failure(&metadata);
                self.notify_failure(metadata).await
            }
            (State::Cancelled | State::Enqueued | State::Fetching, _) => {
                self.fetch(metadata, last_fetched_at).await
            }
            (State::Persisted, _) => self.notify(metadata).await,
            (State::NotifyResetAll | State::NotifyPrepare | State::NotifyEvents, _) => {
                self.notify_prepare(metadata).await
            }
            (State::Success | State::NotifySuccess, _) => self.notify_success(metadata).await,
            (State::Failure | State::NotifyFailure, _) => self.notify_failure(metadata).await,
            (State::NotifyComplete, _) => self.notify_complete(metadata).await,
        }
    }

    fn report_failure(&self, metadata: &EventMetadata) {
        warn!(
            config = %self.config,
            retry = metadata.retry,
            state = ?metadata.state,
            event_id = ?metadata.event_id,
            "Event metadata reached its retry limit"
        );
    }

    /// Newest cursor of the stream.
    pub async fn latest_event_id(&self) -> Result<EventId, EventManagerError> {
        let response = self
            .deps
            .api
            .get_latest_event_id(self.config.user_id(), self.deserializer.endpoint())
            .await?;
        Ok(self.deserializer.deserialize_latest_event_id(&response)?)
    }

    async fn transition(
        &self,
        metadata: &EventMetadata,
        state: State,
    ) -> Result<EventMetadata, EventManagerError> {
        let next = metadata.with_state(state);
        self.deps.repository.update_metadata(&next).await?;
        Ok(next)
    }

    async fn fetch(
        &self,
        metadata: EventMetadata,
        last_fetched_at: Option<OffsetDateTime>,
    ) -> Result<(), EventManagerError> {
        let min_interval = self.deps.settings.current().min_fetch_interval;
        if let Some(remaining) =
            fetch_throttle_remaining(last_fetched_at, OffsetDateTime::now_utc(), min_interval)
        {
            debug!(config = %self.config, ?remaining, "Fetch throttled");
            self.deps.worker.enqueue(&self.config, false);
            return Ok(());
        }

        let (metadata, event_id) = match metadata.event_id.clone() {
            Some(event_id) => (metadata, event_id),
            None => {
                let latest = self.latest_event_id().await?;
                self.deps
                    .repository
                    .update_event_id(&self.config, None, &latest)
                    .await?;
                (metadata.with_event_id(latest.clone()), latest)
            }
        };

        let fetching = self.transition(&metadata, State::Fetching).await?;
        match self.fetch_and_persist(&fetching, &event_id).await {
            Ok(persisted) => self.notify(persisted).await,
            Err(error) => {
                let enqueued = self.transition(&fetching, State::Enqueued).await?;
                for listener in self.listeners() {
                    listener.on_fetch_error(&self.config, &error).await;
                }
                match &error {
                    EventManagerError::Api(e) if e.is_force_update() || e.is_unauthorized() => {
                        self.count_failed_fetch(&enqueued).await?;
                        Err(error)
                    }
                    EventManagerError::Api(e) if !e.is_retryable() => {
                        warn!(config = %self.config, error = %error, "Unrecoverable fetch error, resetting");
                        self.notify_reset_all(enqueued).await
                    }
                    EventManagerError::Deserialization(_) => {
                        warn!(config = %self.config, error = %error, "Unreadable event batch, resetting");
                        self.notify_reset_all(enqueued).await
                    }
                    _ => {
                        self.count_failed_fetch(&enqueued).await?;
                        Err(error)
                    }
                }
            }
        }
    }

    /// A fetch that will be retried counts towards the retry tiers.
    async fn count_failed_fetch(&self, enqueued: &EventMetadata) -> Result<(), EventManagerError> {
        self.deps
            .repository
            .update_metadata(&enqueued.with_retry(enqueued.retry + 1))
            .await?;
        Ok(())
    }

    async fn fetch_and_persist(
        &self,
        metadata: &EventMetadata,
        event_id: &EventId,
    ) -> Result<EventMetadata, EventManagerError> {
        let response = self
            .deps
            .api
            .get_events(&self.config, event_id, self.deserializer.endpoint())
            .await?;
        let fetched = self
            .deserializer
            .deserialize_event_metadata(event_id, &response)?;
        let persisted = EventMetadata {
            retry: metadata.retry,
            created_at: metadata.created_at,
            ..fetched
        }
        .with_state(State::Persisted);
        self.deps.repository.update_metadata(&persisted).await?;
        debug!(
            config = %self.config,
            event_id = %event_id,
            next_event_id = ?persisted.next_event_id,
            more = ?persisted.more,
            "Event batch persisted"
        );
        Ok(persisted)
    }

    async fn notify(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        match metadata.refresh {
            None | Some(RefreshType::Nothing) => self.notify_prepare(metadata).await,
            Some(_) => self.notify_reset_all(metadata).await,
        }
    }

    async fn run_listeners(
        &self,
        phase: Phase,
        metadata: &EventMetadata,
    ) -> Result<(), EventManagerError> {
        for listener in self.listeners() {
            let result = match phase {
                Phase::Prepare => listener.notify_prepare(metadata).await,
                Phase::Events => listener.notify_events(metadata).await,
                Phase::Success => listener.notify_success(metadata).await,
                Phase::Failure => listener.notify_failure(metadata).await,
                Phase::ResetAll => listener.notify_reset_all(metadata).await,
                Phase::Complete => listener.notify_complete(metadata).await,
            };
            result.map_err(|error| EventManagerError::Listener {
                phase,
                order: listener.order(),
                error,
            })?;
        }
        Ok(())
    }

    /// Park the record in `failure_state` and retry it.
    async fn on_phase_failure(
        &self,
        metadata: &EventMetadata,
        failure_state: State,
        error: EventManagerError,
    ) -> Result<(), EventManagerError> {
        error!(
            config = %self.config,
            retry = metadata.retry,
            state = ?failure_state,
            error = %error,
            "Listener notification failed"
        );
        self.deps
            .repository
            .update_metadata(&metadata.with_state(failure_state))
            .await?;
        self.reschedule(true, true).await;
        Ok(())
    }

    async fn notify_reset_all(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let mut current = self.transition(&metadata, State::NotifyResetAll).await?;
        if current.next_event_id.is_none() {
            let latest = self.latest_event_id().await?;
            current = current.with_next_event_id(latest);
            self.deps.repository.update_metadata(&current).await?;
        }
        match self.run_listeners(Phase::ResetAll, &current).await {
            Ok(()) => self.notify_complete(current).await,
            Err(e) => self.on_phase_failure(&current, State::NotifyResetAll, e).await,
        }
    }

    async fn notify_prepare(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let current = self.transition(&metadata, State::NotifyPrepare).await?;
        match self.run_listeners(Phase::Prepare, &current).await {
            Ok(()) => self.notify_events(current).await,
            Err(e) => self.on_phase_failure(&current, State::NotifyPrepare, e).await,
        }
    }

    async fn notify_events(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let mut tx = self.deps.repository.begin().await?;
        let current = metadata.with_state(State::NotifyEvents);
        tx.update_metadata(&current).await?;
        match self.run_listeners(Phase::Events, &current).await {
            Ok(()) => {
                let success = current.with_state(State::Success);
                tx.update_metadata(&success).await?;
                tx.commit().await?;
                self.notify_success(success).await
            }
            Err(e) => {
                drop(tx);
                self.on_phase_failure(&metadata, State::NotifyPrepare, e).await
            }
        }
    }

    async fn notify_success(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let current = self.transition(&metadata, State::NotifySuccess).await?;
        match self.run_listeners(Phase::Success, &current).await {
            Ok(()) => self.notify_complete(current).await,
            Err(e) => self.on_phase_failure(&current, State::Success, e).await,
        }
    }

    async fn notify_failure(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let current = self.transition(&metadata, State::NotifyFailure).await?;
        match self.run_listeners(Phase::Failure, &current).await {
            Ok(()) => self.notify_reset_all(current).await,
            Err(e) => self.on_phase_failure(&current, State::Failure, e).await,
        }
    }

    async fn notify_complete(&self, metadata: EventMetadata) -> Result<(), EventManagerError> {
        let current = self.transition(&metadata, State::NotifyComplete).await?;
        for listener in self.listeners() {
            if let Err(e) = listener.notify_complete(&current).await {
                warn!(
                    config = %self.config,
                    order = listener.order(),
                    error = %e,
                    "Listener failed to complete, ignoring"
                );
            }
        }
        let completed = self.transition(&current, State::Completed).await?;
        debug!(
            config = %self.config,
            event_id = ?completed.event_id,
            next_event_id = ?completed.next_event_id,
            "Event batch completed"
        );
        self.reschedule(completed.more.unwrap_or(false), false).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    async fn reschedule(&self, immediately: bool, failure: bool) {
        let action = self.enqueue_or_stop(immediately, failure).await;
        self.apply(action).await;
    }

    /// Decide whether this config should keep syncing and persist the
    /// record the next run starts from.
    pub async fn enqueue_or_stop(&self, immediately: bool, failure: bool) -> NextAction {
        let ready = self
            .deps
            .accounts
            .get_account(self.config.user_id())
            .await
            .is_some_and(|account| account.is_ready());
        if !ready {
            return NextAction::Stop;
        }

        let running = self.deps.worker.is_running(&self.config);
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.persist_next(immediately, failure, running).await {
                Ok(action) => return action,
                Err(e) => {
                    warn!(config = %self.config, attempt, error = %e, "Failed to persist next event metadata");
                    if attempt < PERSIST_ATTEMPTS {
                        tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                    }
                }
            }
        }
        error!(
            config = %self.config,
            attempts = PERSIST_ATTEMPTS,
            "Giving up on scheduling, waiting for the next trigger"
        );
        NextAction::None
    }

    async fn persist_next(
        &self,
        immediately: bool,
        failure: bool,
        running: bool,
    ) -> Result<NextAction, RepositoryError> {
        let enqueue = NextAction::Enqueue { immediately };
        let mut tx = self.deps.repository.begin().await?;
        let records = tx.get(&self.config).await?;
        let action = match current_metadata(&records) {
            None => {
                tx.update_metadata(&EventMetadata::new(self.config.clone()))
                    .await?;
                enqueue
            }
            Some(current) if current.is_completed() => {
                for old in records
                    .iter()
                    .filter(|m| m.is_completed() && m.event_id != current.event_id)
                {
                    tx.delete(&self.config, old.event_id.as_ref()).await?;
                }
                tx.update_metadata(&EventMetadata::chained_from(current))
                    .await?;
                enqueue
            }
            Some(current) if matches!(current.state, State::Cancelled | State::Enqueued) => enqueue,
            Some(current) if failure => {
                tx.update_metadata(&current.with_retry(current.retry + 1))
                    .await?;
                enqueue
            }
            Some(_) if running => NextAction::None,
            Some(_) => enqueue,
        };
        tx.commit().await?;
        Ok(action)
    }

    async fn apply(&self, action: NextAction) {
        match action {
            NextAction::Enqueue { immediately } => {
                self.deps.worker.enqueue(&self.config, immediately);
            }
            NextAction::Stop => self.cancel().await,
            NextAction::None => {}
        }
    }

    /// Cancel the worker job and park the in-flight record.
    async fn cancel(&self) {
        self.deps.worker.cancel(&self.config);
        let records = match self.deps.repository.get(&self.config).await {
            Ok(records) => records,
            Err(e) => {
                warn!(config = %self.config, error = %e, "Failed to load event metadata on cancel");
                return;
            }
        };
        let Some(current) = current_metadata(&records).filter(|m| !m.is_completed()) else {
            return;
        };
        let cancelled = current.with_state(State::Cancelled).with_retry(0);
        if let Err(e) = self.deps.repository.update_metadata(&cancelled).await {
            warn!(config = %self.config, error = %e, "Failed to cancel event metadata");
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start observing the account and the app lifecycle.
    pub async fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_none() {
            *lifecycle = Some(self.spawn_observer());
            info!(config = %self.config, "Event manager started");
        }
    }

    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
    }

    /// Start if stopped, otherwise schedule a run right away.
    pub async fn resume(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_none() {
            *lifecycle = Some(self.spawn_observer());
        } else {
            self.reschedule(true, false).await;
        }
    }

    /// Run `block` with this manager stopped and no batch in flight.
    ///
    /// A started manager is restarted afterwards, also when `block` panics.
    /// `block` must not call [`EventManager::process`].
    pub async fn suspend<F, R>(self: &Arc<Self>, block: F) -> R
    where
        F: Future<Output = R>,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        let was_started = lifecycle.is_some();
        self.stop_locked(&mut lifecycle).await;

        let outcome = {
            let _processing = self.processing.lock().await;
            AssertUnwindSafe(block).catch_unwind().await
        };

        if was_started {
            *lifecycle = Some(self.spawn_observer());
        }
        drop(lifecycle);

        match outcome {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Remove every record of this config.
    pub async fn delete_all_metadata(&self) -> Result<(), EventManagerError> {
        let _processing = self.processing.lock().await;
        self.deps.repository.delete_all(&self.config).await?;
        Ok(())
    }

    async fn stop_locked(&self, lifecycle: &mut Option<JoinHandle<()>>) {
        if let Some(observer) = lifecycle.take() {
            observer.abort();
            info!(config = %self.config, "Event manager stopped");
        }
        self.cancel().await;
    }

    fn spawn_observer(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut account_rx = self.deps.accounts.observe_account(self.config.user_id());
        let mut app_rx = self.deps.app_lifecycle.state();
        app_rx.borrow_and_update();

        tokio::spawn(async move {
            let mut last_state: Option<Option<AccountState>> = None;
            let mut app_open = true;
            loop {
                let state = account_rx.borrow_and_update().as_ref().map(|a| a.state);
                if last_state != Some(state) {
                    last_state = Some(state);
                    let Some(manager) = manager.upgrade() else { break };
                    manager.reschedule(true, false).await;
                }

                tokio::select! {
                    changed = account_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = app_rx.changed(), if app_open => {
                        if changed.is_err() {
                            app_open = false;
                            continue;
                        }
                        if *app_rx.borrow_and_update() == AppLifecycleState::Foreground {
                            let Some(manager) = manager.upgrade() else { break };
                            manager.reschedule(true, false).await;
                        }
                    }
                }
            }
        })
    }
}
