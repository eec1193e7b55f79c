//! Listener contract of the state machine and the typed per-entity adapter.
//!
//! An [`EventListener`] sees whole batches, phase by phase. Most consumers
//! want per-entity callbacks instead; they implement [`EventHandler`] and
//! register it wrapped in an [`ActionListener`].

use crate::entities::{Action, Event, EventManagerConfig, EventMetadata, EventsResponse, ListenerType};
use crate::processors::EventManagerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Receives the notification phases of every batch of one listener type.
///
/// Calls within a phase are sequential in ascending [`EventListener::order`].
/// The batch payload is `metadata.response`.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn listener_type(&self) -> ListenerType;

    /// Rank among listeners of the same type. Lower ranks run first.
    fn order(&self) -> i32;

    async fn notify_prepare(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs inside the metadata transaction; keep it short. The in-memory
    /// repository is locked for every config until it returns, so it must
    /// not await the metadata repository.
    async fn notify_events(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify_success(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify_failure(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    /// Local state of this listener type must be rebuilt from scratch.
    async fn notify_reset_all(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    /// Last phase of every batch. Errors are logged and never block completion.
    async fn notify_complete(&self, _metadata: &EventMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_fetch_error(&self, _config: &EventManagerConfig, _error: &EventManagerError) {}
}

/// Per-entity callbacks for one listener type.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Entity: Clone + Send + Sync + 'static;

    fn listener_type(&self) -> ListenerType;

    fn order(&self) -> i32;

    /// Pick this handler's entities out of a raw batch.
    fn deserialize_events(
        &self,
        response: &EventsResponse,
    ) -> anyhow::Result<Vec<Event<Self::Key, Self::Entity>>>;

    /// Created and updated entities, before any of them is applied.
    async fn on_prepare(
        &self,
        _config: &EventManagerConfig,
        _entities: &[Self::Entity],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_create(
        &self,
        _config: &EventManagerConfig,
        _entities: &[Self::Entity],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update(
        &self,
        _config: &EventManagerConfig,
        _entities: &[Self::Entity],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_partial(
        &self,
        _config: &EventManagerConfig,
        _entities: &[Self::Entity],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_delete(&self, _config: &EventManagerConfig, _keys: &[Self::Key]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_reset_all(&self, _config: &EventManagerConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_success(&self, _config: &EventManagerConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_failure(&self, _config: &EventManagerConfig) -> anyhow::Result<()> {
        Ok(())
    }

    /// End of a batch, whether it was applied or not.
    async fn on_complete(&self, _config: &EventManagerConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

type ActionMap<K, T> = HashMap<Action, Vec<Event<K, T>>>;

/// Adapts an [`EventHandler`] to the [`EventListener`] phases.
///
/// The batch is grouped by action during prepare and kept per config until
/// the batch completes.
pub struct ActionListener<H: EventHandler> {
    handler: H,
    actions: Mutex<HashMap<EventManagerConfig, ActionMap<H::Key, H::Entity>>>,
}

impl<H: EventHandler> ActionListener<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            actions: Mutex::new(HashMap::new()),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn group(events: Vec<Event<H::Key, H::Entity>>) -> ActionMap<H::Key, H::Entity> {
        let mut map: ActionMap<H::Key, H::Entity> = HashMap::new();
        for event in events {
            map.entry(event.action).or_default().push(event);
        }
        map
    }

    /// Action map of the batch of `metadata`, parsing it again when prepare
    /// ran in an earlier process.
    fn actions_for(&self, metadata: &EventMetadata) -> anyhow::Result<ActionMap<H::Key, H::Entity>> {
        let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = actions.get(&metadata.config) {
            return Ok(map.clone());
        }
        let map = match &metadata.response {
            Some(response) => Self::group(self.handler.deserialize_events(response)?),
            None => HashMap::new(),
        };
        actions.insert(metadata.config.clone(), map.clone());
        Ok(map)
    }

    fn clear(&self, config: &EventManagerConfig) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config);
    }
}

fn entities<K, T: Clone>(map: &ActionMap<K, T>, action: Action) -> Vec<T> {
    map.get(&action)
        .map(|events| events.iter().filter_map(|e| e.entity.clone()).collect())
        .unwrap_or_default()
}

#[async_trait]
impl<H: EventHandler> EventListener for ActionListener<H> {
    fn listener_type(&self) -> ListenerType {
        self.handler.listener_type()
    }

    fn order(&self) -> i32 {
        self.handler.order()
    }

    async fn notify_prepare(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        // A retried prepare must see the batch as it is now.
        self.clear(&metadata.config);
        let map = self.actions_for(metadata)?;
        let mut prepared = entities(&map, Action::Create);
        prepared.extend(entities(&map, Action::Update));
        if !prepared.is_empty() {
            self.handler.on_prepare(&metadata.config, &prepared).await?;
        }
        Ok(())
    }

    async fn notify_events(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        let config = &metadata.config;
        let map = self.actions_for(metadata)?;

        let created = entities(&map, Action::Create);
        if !created.is_empty() {
            self.handler.on_create(config, &created).await?;
        }
        let updated = entities(&map, Action::Update);
        if !updated.is_empty() {
            self.handler.on_update(config, &updated).await?;
        }
        let partial = entities(&map, Action::Partial);
        if !partial.is_empty() {
            self.handler.on_partial(config, &partial).await?;
        }
        let deleted: Vec<H::Key> = map
            .get(&Action::Delete)
            .map(|events| events.iter().map(|e| e.key.clone()).collect())
            .unwrap_or_default();
        if !deleted.is_empty() {
            self.handler.on_delete(config, &deleted).await?;
        }
        Ok(())
    }

    async fn notify_success(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        self.handler.on_success(&metadata.config).await
    }

    async fn notify_failure(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        self.handler.on_failure(&metadata.config).await
    }

    async fn notify_reset_all(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        self.handler.on_reset_all(&metadata.config).await
    }

    async fn notify_complete(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        let result = self.handler.on_complete(&metadata.config).await;
        self.clear(&metadata.config);
        result
    }
}
