//! Background scheduling of `EventManager::process`.
//!
//! [`EventWorkerScheduler`] owns one timer task per config that emits
//! [`ProcessTick`]s; [`EventWorkerRunner`] consumes the ticks and runs the
//! matching manager, at most once at a time per config.

use super::provider::EventManagerProvider;
use crate::account::AppLifecycleState;
use crate::config::{EngineSettings, SettingsStore};
use crate::entities::EventManagerConfig;
use crate::events::{ProcessTick, ProcessTickReceiver, ProcessTickSender};
use crate::utils::backoff::calculate_retry_delay;
use kanau::processor::Processor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Background job control used by the state machine.
pub trait EventWorkerManager: Send + Sync {
    /// Schedule a run. A non-immediate request never postpones a job that
    /// is already pending.
    fn enqueue(&self, config: &EventManagerConfig, immediately: bool);

    fn cancel(&self, config: &EventManagerConfig);

    /// Whether a run of `config` is executing right now.
    fn is_running(&self, config: &EventManagerConfig) -> bool;

    /// Whether a run of `config` is waiting for its timer.
    fn is_enqueued(&self, config: &EventManagerConfig) -> bool;
}

#[derive(Default)]
struct Job {
    pending: Option<JoinHandle<()>>,
    running: bool,
    rerun: bool,
    attempts: u32,
}

impl Job {
    fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

/// Timer-based [`EventWorkerManager`].
pub struct EventWorkerScheduler {
    tick_tx: ProcessTickSender,
    settings: SettingsStore<EngineSettings>,
    app_state: watch::Receiver<AppLifecycleState>,
    jobs: Mutex<HashMap<EventManagerConfig, Job>>,
}

impl EventWorkerScheduler {
    pub fn new(
        tick_tx: ProcessTickSender,
        settings: SettingsStore<EngineSettings>,
        app_state: watch::Receiver<AppLifecycleState>,
    ) -> Self {
        Self {
            tick_tx,
            settings,
            app_state,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<EventManagerConfig, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initial_delay(&self, immediately: bool) -> Duration {
        let settings = self.settings.current();
        if immediately {
            return settings.immediate_initial_delay;
        }
        match *self.app_state.borrow() {
            AppLifecycleState::Foreground => settings.repeat_interval_foreground,
            AppLifecycleState::Background => settings.repeat_interval_background,
        }
    }

    /// Replace the pending job of `config` with one firing after `delay`,
    /// then every background interval.
    fn schedule(&self, job: &mut Job, config: &EventManagerConfig, delay: Duration) {
        job.abort_pending();
        let tick_tx = self.tick_tx.clone();
        let settings = self.settings.clone();
        let config = config.clone();
        debug!(config = %config, ?delay, "Scheduling event worker");

        job.pending = Some(tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                let tick = ProcessTick {
                    config: config.clone(),
                };
                if let Err(e) = tick_tx.send(tick).await {
                    warn!(config = %config, error = %e, "Failed to send ProcessTick, receiver dropped");
                    return;
                }
                delay = settings.current().repeat_interval_background;
            }
        }));
    }

    /// Mark a run of `config` as started. Returns `false` when one is
    /// already running; that run then repeats once when it finishes.
    pub fn begin_run(&self, config: &EventManagerConfig) -> bool {
        let mut jobs = self.jobs();
        let job = jobs.entry(config.clone()).or_default();
        if job.running {
            job.rerun = true;
            return false;
        }
        job.running = true;
        true
    }

    /// Mark a run of `config` as finished. Returns whether it must run again.
    ///
    /// A failed run is retried with exponential backoff.
    pub fn end_run(&self, config: &EventManagerConfig, success: bool) -> bool {
        let backoff = self.settings.current().backoff_delay;
        let mut jobs = self.jobs();
        let job = jobs.entry(config.clone()).or_default();
        if success {
            job.attempts = 0;
            if std::mem::take(&mut job.rerun) {
                return true;
            }
            job.running = false;
            return false;
        }

        let delay = calculate_retry_delay(backoff, job.attempts);
        job.attempts = job.attempts.saturating_add(1);
        job.rerun = false;
        job.running = false;
        warn!(config = %config, attempts = job.attempts, ?delay, "Event worker run failed, backing off");
        self.schedule(job, config, delay);
        false
    }
}

impl EventWorkerManager for EventWorkerScheduler {
    fn enqueue(&self, config: &EventManagerConfig, immediately: bool) {
        let delay = self.initial_delay(immediately);
        let mut jobs = self.jobs();
        let job = jobs.entry(config.clone()).or_default();
        if !immediately && job.is_pending() {
            return;
        }
        self.schedule(job, config, delay);
    }

    fn cancel(&self, config: &EventManagerConfig) {
        let mut jobs = self.jobs();
        if let Some(job) = jobs.get_mut(config) {
            job.abort_pending();
            job.rerun = false;
            job.attempts = 0;
            if !job.running {
                jobs.remove(config);
            }
            debug!(config = %config, "Event worker cancelled");
        }
    }

    fn is_running(&self, config: &EventManagerConfig) -> bool {
        self.jobs().get(config).is_some_and(|j| j.running)
    }

    fn is_enqueued(&self, config: &EventManagerConfig) -> bool {
        self.jobs().get(config).is_some_and(Job::is_pending)
    }
}

impl Drop for EventWorkerScheduler {
    fn drop(&mut self) {
        for job in self.jobs().values_mut() {
            job.abort_pending();
        }
    }
}

/// Consumes [`ProcessTick`]s and runs the matching manager.
pub struct EventWorkerRunner {
    scheduler: Arc<EventWorkerScheduler>,
    provider: Arc<EventManagerProvider>,
}

impl EventWorkerRunner {
    pub fn new(scheduler: Arc<EventWorkerScheduler>, provider: Arc<EventManagerProvider>) -> Self {
        Self {
            scheduler,
            provider,
        }
    }

    /// Run until shutdown is signaled or every tick sender is dropped.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>, mut tick_rx: ProcessTickReceiver) {
        let mut runs = JoinSet::new();
        info!("EventWorkerRunner started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("EventWorkerRunner received shutdown signal");
                        break;
                    }
                }

                Some(tick) = tick_rx.recv() => {
                    self.dispatch(&mut runs, tick);
                }

                Some(_) = runs.join_next(), if !runs.is_empty() => {}

                else => {
                    info!("ProcessTick channel closed");
                    break;
                }
            }
        }

        runs.shutdown().await;
        info!("EventWorkerRunner shutdown complete");
    }

    fn dispatch(&self, runs: &mut JoinSet<()>, tick: ProcessTick) {
        if !self.scheduler.begin_run(&tick.config) {
            debug!(config = %tick.config, "Run already in progress, will repeat");
            return;
        }
        let scheduler = Arc::clone(&self.scheduler);
        let provider = Arc::clone(&self.provider);

        runs.spawn(async move {
            loop {
                let result = provider.process(tick.clone()).await;
                if let Err(e) = &result {
                    warn!(config = %tick.config, error = %e, "Event processing failed");
                }
                if !scheduler.end_run(&tick.config, result.is_ok()) {
                    break;
                }
            }
        });
    }
}
