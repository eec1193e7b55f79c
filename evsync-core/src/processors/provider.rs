//! Registry of event managers, one per config.

use super::event_manager::{EventManager, EventManagerDeps, EventManagerError};
use crate::deserializer::deserializer_for;
use crate::entities::{EventManagerConfig, UserId};
use crate::events::ProcessTick;
use crate::listener::EventListener;
use crate::repository::{EventMetadataRepository, RepositoryError};
use async_trait::async_trait;
use kanau::processor::Processor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Resolves the configs that exist for a user.
#[async_trait]
pub trait EventManagerConfigProvider: Send + Sync {
    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventManagerConfig>, RepositoryError>;
}

/// The user's core stream plus every stream that already has metadata.
pub struct RepositoryConfigProvider {
    repository: Arc<dyn EventMetadataRepository>,
}

impl RepositoryConfigProvider {
    pub fn new(repository: Arc<dyn EventMetadataRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventManagerConfigProvider for RepositoryConfigProvider {
    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventManagerConfig>, RepositoryError> {
        let mut configs = vec![EventManagerConfig::core(user_id.clone())];
        for metadata in self.repository.get_all(user_id).await? {
            if !configs.contains(&metadata.config) {
                configs.push(metadata.config);
            }
        }
        Ok(configs)
    }
}

/// Creates managers lazily and keeps them for the lifetime of the process.
pub struct EventManagerProvider {
    deps: EventManagerDeps,
    config_provider: Arc<dyn EventManagerConfigProvider>,
    listeners: Vec<Arc<dyn EventListener>>,
    managers: Mutex<HashMap<EventManagerConfig, Arc<EventManager>>>,
}

impl EventManagerProvider {
    pub fn new(
        deps: EventManagerDeps,
        config_provider: Arc<dyn EventManagerConfigProvider>,
        listeners: Vec<Arc<dyn EventListener>>,
    ) -> Self {
        Self {
            deps,
            config_provider,
            listeners,
            managers: Mutex::new(HashMap::new()),
        }
    }

    fn managers(&self) -> MutexGuard<'_, HashMap<EventManagerConfig, Arc<EventManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The manager of `config`, created with its matching listeners on first use.
    pub fn get(&self, config: &EventManagerConfig) -> Arc<EventManager> {
        let mut managers = self.managers();
        if let Some(manager) = managers.get(config) {
            return Arc::clone(manager);
        }

        let manager = Arc::new(EventManager::new(
            deserializer_for(config),
            self.deps.clone(),
        ));
        for listener in &self.listeners {
            if listener.listener_type() == config.listener_type() {
                manager.subscribe(Arc::clone(listener));
            }
        }
        debug!(config = %config, "Created event manager");
        managers.insert(config.clone(), Arc::clone(&manager));
        manager
    }

    /// Managers of every config known for `user_id`.
    pub async fn get_all(&self, user_id: &UserId) -> Result<Vec<Arc<EventManager>>, RepositoryError> {
        let configs = self.config_provider.get_all(user_id).await?;
        Ok(configs.iter().map(|config| self.get(config)).collect())
    }

    /// Managers created so far.
    pub fn active(&self) -> Vec<Arc<EventManager>> {
        self.managers().values().cloned().collect()
    }
}

impl Processor<ProcessTick> for EventManagerProvider {
    type Output = ();
    type Error = EventManagerError;

    async fn process(&self, tick: ProcessTick) -> Result<(), EventManagerError> {
        self.get(&tick.config).process().await
    }
}
