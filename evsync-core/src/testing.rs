//! In-process fakes shared by the unit tests.

use crate::account::{AccountManager, AppLifecycle, AppLifecycleState, InMemoryAccountStore};
use crate::api::{ApiError, EventApi};
use crate::config::{EngineSettings, SettingsStore};
use crate::deserializer::deserializer_for;
use crate::entities::{
    Account, AccountState, EventId, EventIdResponse, EventManagerConfig, EventMetadata,
    EventsResponse, ListenerType, Session, SessionState, UserId,
};
use crate::listener::EventListener;
use crate::processors::{EventManager, EventManagerDeps, EventManagerError, EventWorkerManager, Phase};
use crate::repository::{
    EventMetadataRepository, InMemoryEventMetadataRepository, MetadataTransaction, RepositoryError,
};
use crate::session::{AuthRepository, SessionListener};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const USER: &str = "user";

/// Body of a core batch pointing at `next`.
pub fn core_batch(next: &str, refresh: i32, more: bool) -> String {
    format!(
        r#"{{"Code":1000,"EventID":"{next}","Refresh":{refresh},"More":{}}}"#,
        i32::from(more)
    )
}

/// Body of a core `latest` response.
pub fn latest_body(event_id: &str) -> String {
    format!(r#"{{"Code":1000,"EventID":"{event_id}"}}"#)
}

// ---------------------------------------------------------------------------
// Metadata storage
// ---------------------------------------------------------------------------

/// In-memory repository whose transactions can be made to fail.
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryEventMetadataRepository,
    failing_begins: AtomicU32,
}

impl FlakyRepository {
    /// The next `count` calls to `begin` fail.
    pub fn fail_next_begins(&self, count: u32) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventMetadataRepository for FlakyRepository {
    async fn get(&self, config: &EventManagerConfig) -> Result<Vec<EventMetadata>, RepositoryError> {
        self.inner.get(config).await
    }

    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError> {
        self.inner.get_all(user_id).await
    }

    async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
        self.inner.update_metadata(metadata).await
    }

    async fn update_event_id(
        &self,
        config: &EventManagerConfig,
        old: Option<&EventId>,
        new: &EventId,
    ) -> Result<(), RepositoryError> {
        self.inner.update_event_id(config, old, new).await
    }

    async fn delete(
        &self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError> {
        self.inner.delete(config, event_id).await
    }

    async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
        self.inner.delete_all(config).await
    }

    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, RepositoryError> {
        let failing = self
            .failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepositoryError::Unavailable("injected failure".to_string()));
        }
        self.inner.begin().await
    }
}

// ---------------------------------------------------------------------------
// Remote API
// ---------------------------------------------------------------------------

/// Replays scripted responses in order.
#[derive(Default)]
pub struct FakeEventApi {
    latest: Mutex<VecDeque<Result<String, ApiError>>>,
    events: Mutex<VecDeque<Result<String, ApiError>>>,
    requested: Mutex<Vec<EventId>>,
}

impl FakeEventApi {
    pub fn push_latest(&self, response: Result<String, ApiError>) {
        self.latest.lock().unwrap().push_back(response);
    }

    pub fn push_events(&self, response: Result<String, ApiError>) {
        self.events.lock().unwrap().push_back(response);
    }

    /// Cursors passed to `get_events`, in call order.
    pub fn requested(&self) -> Vec<EventId> {
        self.requested.lock().unwrap().clone()
    }

    fn next(queue: &Mutex<VecDeque<Result<String, ApiError>>>) -> Result<String, ApiError> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Connection("no scripted response".to_string())))
    }
}

#[async_trait]
impl EventApi for FakeEventApi {
    async fn get_latest_event_id(
        &self,
        _user_id: &UserId,
        _endpoint: &str,
    ) -> Result<EventIdResponse, ApiError> {
        Self::next(&self.latest).map(|body| EventIdResponse { body })
    }

    async fn get_events(
        &self,
        _config: &EventManagerConfig,
        event_id: &EventId,
        _endpoint: &str,
    ) -> Result<EventsResponse, ApiError> {
        self.requested.lock().unwrap().push(event_id.clone());
        Self::next(&self.events).map(|body| EventsResponse { body })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCall {
    Enqueue { immediately: bool },
    Cancel,
}

#[derive(Default)]
pub struct RecordingWorker {
    calls: Mutex<Vec<WorkerCall>>,
    running: AtomicBool,
}

impl RecordingWorker {
    pub fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl EventWorkerManager for RecordingWorker {
    fn enqueue(&self, _config: &EventManagerConfig, immediately: bool) {
        self.calls
            .lock()
            .unwrap()
            .push(WorkerCall::Enqueue { immediately });
    }

    fn cancel(&self, _config: &EventManagerConfig) {
        self.calls.lock().unwrap().push(WorkerCall::Cancel);
    }

    fn is_running(&self, _config: &EventManagerConfig) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_enqueued(&self, _config: &EventManagerConfig) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Writes `"{order}:{phase}"` to a shared log for every notification.
pub struct RecordingListener {
    listener_type: ListenerType,
    order: i32,
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Mutex<Option<Phase>>,
    fetch_errors: AtomicUsize,
}

impl RecordingListener {
    pub fn new(order: i32, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Self::with_type(ListenerType::Core, order, log)
    }

    pub fn with_type(listener_type: ListenerType, order: i32, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            listener_type,
            order,
            log,
            fail_on: Mutex::new(None),
            fetch_errors: AtomicUsize::new(0),
        })
    }

    pub fn fail_on(&self, phase: Phase) {
        *self.fail_on.lock().unwrap() = Some(phase);
    }

    pub fn fail_on_none(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn fetch_errors(&self) -> usize {
        self.fetch_errors.load(Ordering::SeqCst)
    }

    fn record(&self, phase: Phase) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{phase}", self.order));
        if *self.fail_on.lock().unwrap() == Some(phase) {
            anyhow::bail!("listener {} refused {phase}", self.order);
        }
        Ok(())
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    fn listener_type(&self) -> ListenerType {
        self.listener_type
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn notify_prepare(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::Prepare)
    }

    async fn notify_events(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::Events)
    }

    async fn notify_success(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::Success)
    }

    async fn notify_failure(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::Failure)
    }

    async fn notify_reset_all(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::ResetAll)
    }

    async fn notify_complete(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        self.record(Phase::Complete)
    }

    async fn on_fetch_error(&self, _config: &EventManagerConfig, _error: &EventManagerError) {
        self.fetch_errors.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Manager harness
// ---------------------------------------------------------------------------

/// A core manager for a ready account named [`USER`], wired to fakes.
pub struct Harness {
    pub manager: Arc<EventManager>,
    pub repository: Arc<FlakyRepository>,
    pub api: Arc<FakeEventApi>,
    pub worker: Arc<RecordingWorker>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub settings: SettingsStore<EngineSettings>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub deps: EventManagerDeps,
}

impl Harness {
    pub async fn new() -> Self {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.add_account(
            Account {
                user_id: UserId::from(USER),
                username: USER.into(),
                state: AccountState::Ready,
                session_id: None,
                session_state: Some(SessionState::Authenticated),
            },
            None,
        );
        let repository = Arc::new(FlakyRepository::default());
        let api = Arc::new(FakeEventApi::default());
        let worker = Arc::new(RecordingWorker::default());
        let app_lifecycle = Arc::new(AppLifecycle::new(AppLifecycleState::Foreground));
        let settings = SettingsStore::new(EngineSettings::default());

        let deps = EventManagerDeps {
            repository: repository.clone(),
            api: api.clone(),
            worker: worker.clone(),
            accounts: accounts.clone(),
            app_lifecycle,
            settings: settings.clone(),
        };
        let config = EventManagerConfig::core(UserId::from(USER));
        let manager = Arc::new(EventManager::new(deserializer_for(&config), deps.clone()));

        Self {
            manager,
            repository,
            api,
            worker,
            accounts,
            settings,
            log: Arc::new(Mutex::new(Vec::new())),
            deps,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub async fn set_account_state(&self, state: AccountState) {
        self.accounts
            .update_account_state(&UserId::from(USER), state)
            .await;
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Auth backend that numbers every token it issues.
#[derive(Default)]
pub struct FakeAuthRepository {
    refresh_calls: AtomicUsize,
    request_calls: AtomicUsize,
    refresh_error: Mutex<Option<ApiError>>,
    latency: Mutex<Duration>,
}

impl FakeAuthRepository {
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    /// Every later refresh fails with `error`.
    pub fn fail_refresh(&self, error: ApiError) {
        *self.refresh_error.lock().unwrap() = Some(error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

#[async_trait]
impl AuthRepository for FakeAuthRepository {
    async fn request_session(&self) -> Result<Session, ApiError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            session_id: "new-session".into(),
            user_id: None,
            access_token: "a0".to_string(),
            refresh_token: "r0".to_string(),
            scopes: Vec::new(),
        })
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, ApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let error = self.refresh_error.lock().unwrap().clone();
        if let Some(error) = error {
            return Err(error);
        }
        Ok(Session {
            access_token: format!("a{n}"),
            refresh_token: format!("r{n}"),
            scopes: Vec::new(),
            ..session.clone()
        })
    }

    async fn get_scopes(&self, _session: &Session) -> Result<Vec<String>, ApiError> {
        Ok(vec!["full".to_string()])
    }
}

#[derive(Default)]
pub struct RecordingSessionListener {
    events: Mutex<Vec<String>>,
}

impl RecordingSessionListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl SessionListener for RecordingSessionListener {
    async fn on_session_token_created(&self, session: &Session) {
        self.push(format!("created:{}", session.session_id));
    }

    async fn on_session_token_refreshed(&self, session: &Session) {
        self.push(format!("refreshed:{}", session.session_id));
    }

    async fn on_session_force_logout(&self, session: &Session, http_code: u16) {
        self.push(format!("logout:{}:{http_code}", session.session_id));
    }
}
