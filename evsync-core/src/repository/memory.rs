use super::{EventMetadataRepository, MetadataTransaction, RepositoryError};
use crate::entities::{EventId, EventManagerConfig, EventMetadata, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-local metadata store.
///
/// Transactions hold the table lock for their whole lifetime and work on a
/// staged copy, so they are serializable and a dropped transaction leaves
/// no trace.
///
/// The lock is table-wide: while any transaction is open, every other call
/// on this repository waits, whatever config it is for. That includes the
/// `notify_events` listener phase, which runs inside a transaction. A
/// listener that awaits this repository, or a task that does, from within
/// `notify_events` deadlocks.
#[derive(Clone, Default)]
pub struct InMemoryEventMetadataRepository {
    table: Arc<Mutex<Vec<EventMetadata>>>,
}

impl InMemoryEventMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Vec<EventMetadata>>,
    staged: Vec<EventMetadata>,
}

fn select(table: &[EventMetadata], config: &EventManagerConfig) -> Vec<EventMetadata> {
    table.iter().filter(|m| &m.config == config).cloned().collect()
}

fn upsert(table: &mut Vec<EventMetadata>, metadata: &EventMetadata) -> Result<(), RepositoryError> {
    let position = table
        .iter()
        .position(|m| m.config == metadata.config && m.event_id == metadata.event_id);
    if !metadata.is_completed() {
        let other_in_flight = table.iter().enumerate().any(|(index, m)| {
            m.config == metadata.config && !m.is_completed() && Some(index) != position
        });
        if other_in_flight {
            return Err(RepositoryError::Conflict {
                config: metadata.config.id(),
            });
        }
    }
    match position {
        Some(index) => {
            // Creation time belongs to the row, not to the caller's copy.
            let created_at = table[index].created_at;
            table[index] = EventMetadata {
                created_at,
                ..metadata.clone()
            };
        }
        None => table.push(metadata.clone()),
    }
    Ok(())
}

fn remove(table: &mut Vec<EventMetadata>, config: &EventManagerConfig, event_id: Option<&EventId>) {
    table.retain(|m| !(&m.config == config && m.event_id.as_ref() == event_id));
}

#[async_trait]
impl EventMetadataRepository for InMemoryEventMetadataRepository {
    async fn get(&self, config: &EventManagerConfig) -> Result<Vec<EventMetadata>, RepositoryError> {
        Ok(select(&self.table.lock().await, config))
    }

    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError> {
        let table = self.table.lock().await;
        Ok(table
            .iter()
            .filter(|m| m.user_id() == user_id)
            .cloned()
            .collect())
    }

    async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
        upsert(&mut *self.table.lock().await, metadata)
    }

    async fn update_event_id(
        &self,
        config: &EventManagerConfig,
        old: Option<&EventId>,
        new: &EventId,
    ) -> Result<(), RepositoryError> {
        let mut table = self.table.lock().await;
        if let Some(record) = table
            .iter_mut()
            .find(|m| &m.config == config && m.event_id.as_ref() == old)
        {
            *record = record.with_event_id(new.clone());
        }
        Ok(())
    }

    async fn delete(
        &self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError> {
        remove(&mut *self.table.lock().await, config, event_id);
        Ok(())
    }

    async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
        self.table.lock().await.retain(|m| &m.config != config);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, RepositoryError> {
        let guard = Arc::clone(&self.table).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }
}

#[async_trait]
impl MetadataTransaction for InMemoryTransaction {
    async fn get(
        &mut self,
        config: &EventManagerConfig,
    ) -> Result<Vec<EventMetadata>, RepositoryError> {
        Ok(select(&self.staged, config))
    }

    async fn update_metadata(&mut self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
        upsert(&mut self.staged, metadata)
    }

    async fn delete(
        &mut self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError> {
        remove(&mut self.staged, config, event_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::State;

    fn config() -> EventManagerConfig {
        EventManagerConfig::core(UserId::from("user"))
    }

    fn record(event_id: &str, state: State) -> EventMetadata {
        EventMetadata {
            event_id: Some(EventId::from(event_id)),
            ..EventMetadata::new(config())
        }
        .with_state(state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_transaction_blocks_other_configs() {
        let repo = InMemoryEventMetadataRepository::new();
        let other = EventManagerConfig::core(UserId::from("other"));
        let tx = repo.begin().await.unwrap();

        let blocked = tokio::time::timeout(std::time::Duration::from_secs(1), repo.get(&other)).await;
        assert!(blocked.is_err());

        drop(tx);
        assert!(repo.get(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_in_flight_record_is_rejected() {
        let repo = InMemoryEventMetadataRepository::new();
        repo.update_metadata(&record("1", State::Fetching)).await.unwrap();

        let result = repo.update_metadata(&record("2", State::Enqueued)).await;
        assert!(matches!(result, Err(RepositoryError::Conflict { .. })));

        // Completing the first one frees the slot.
        repo.update_metadata(&record("1", State::Completed)).await.unwrap();
        repo.update_metadata(&record("2", State::Enqueued)).await.unwrap();
        assert_eq!(repo.get(&config()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_replaces_same_cursor() {
        let repo = InMemoryEventMetadataRepository::new();
        repo.update_metadata(&record("1", State::Fetching)).await.unwrap();
        repo.update_metadata(&record("1", State::Persisted)).await.unwrap();

        let records = repo.get(&config()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, State::Persisted);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let repo = InMemoryEventMetadataRepository::new();
        repo.update_metadata(&record("1", State::NotifyPrepare)).await.unwrap();

        {
            let mut tx = repo.begin().await.unwrap();
            tx.update_metadata(&record("1", State::NotifyEvents)).await.unwrap();
            assert_eq!(tx.get(&config()).await.unwrap()[0].state, State::NotifyEvents);
        }
        assert_eq!(repo.get(&config()).await.unwrap()[0].state, State::NotifyPrepare);

        let mut tx = repo.begin().await.unwrap();
        tx.update_metadata(&record("1", State::Success)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.get(&config()).await.unwrap()[0].state, State::Success);
    }

    #[tokio::test]
    async fn test_update_event_id_moves_cursor() {
        let repo = InMemoryEventMetadataRepository::new();
        repo.update_metadata(&EventMetadata::new(config())).await.unwrap();
        repo.update_event_id(&config(), None, &EventId::from("latest"))
            .await
            .unwrap();

        let records = repo.get(&config()).await.unwrap();
        assert_eq!(records[0].event_id, Some(EventId::from("latest")));
    }

    #[tokio::test]
    async fn test_get_all_filters_by_user() {
        let repo = InMemoryEventMetadataRepository::new();
        let other = EventManagerConfig::core(UserId::from("other"));
        let calendar = EventManagerConfig::calendar(UserId::from("user"), "cal");
        repo.update_metadata(&EventMetadata::new(config())).await.unwrap();
        repo.update_metadata(&EventMetadata::new(other)).await.unwrap();
        repo.update_metadata(&EventMetadata::new(calendar)).await.unwrap();

        let records = repo.get_all(&UserId::from("user")).await.unwrap();
        assert_eq!(records.len(), 2);

        repo.delete_all(&config()).await.unwrap();
        assert!(repo.get(&config()).await.unwrap().is_empty());
        assert_eq!(repo.get_all(&UserId::from("user")).await.unwrap().len(), 1);
    }
}
