use super::{EventMetadataRepository, MetadataTransaction, RepositoryError};
use crate::entities::event_metadata::{GetEventMetadataByConfig, GetEventMetadataByUser};
use crate::entities::{EventId, EventManagerConfig, EventMetadata, UserId};
use crate::framework::{DatabaseProcessor, TransactionProcessor};
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;

/// Metadata store backed by the `event_metadata` table.
///
/// The single-in-flight rule is enforced by a partial unique index, so a
/// violating write surfaces as a unique violation and is reported as
/// [`RepositoryError::Conflict`].
#[derive(Clone)]
pub struct PgEventMetadataRepository {
    db: DatabaseProcessor,
}

impl PgEventMetadataRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor { pool },
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }
}

fn map_write_error(config: &EventManagerConfig, error: sqlx::Error) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict {
            config: config.id(),
        },
        _ => RepositoryError::Database(error),
    }
}

#[async_trait]
impl EventMetadataRepository for PgEventMetadataRepository {
    async fn get(&self, config: &EventManagerConfig) -> Result<Vec<EventMetadata>, RepositoryError> {
        let records = self
            .db
            .process(GetEventMetadataByConfig {
                config_key: config.id(),
            })
            .await?;
        Ok(records)
    }

    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError> {
        let records = self
            .db
            .process(GetEventMetadataByUser {
                user_id: user_id.clone(),
            })
            .await?;
        Ok(records)
    }

    async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        tx.upsert_event_metadata(metadata)
            .await
            .map_err(|e| map_write_error(&metadata.config, e))?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_event_id(
        &self,
        config: &EventManagerConfig,
        old: Option<&EventId>,
        new: &EventId,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        tx.replace_event_id(&config.id(), old, new)
            .await
            .map_err(|e| map_write_error(config, e))?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(
        &self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        tx.delete_event_metadata(&config.id(), event_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        tx.delete_all_event_metadata(&config.id()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, RepositoryError> {
        Ok(Box::new(PgMetadataTransaction {
            inner: self.db.begin().await?,
        }))
    }
}

struct PgMetadataTransaction {
    inner: TransactionProcessor<'static>,
}

#[async_trait]
impl MetadataTransaction for PgMetadataTransaction {
    async fn get(
        &mut self,
        config: &EventManagerConfig,
    ) -> Result<Vec<EventMetadata>, RepositoryError> {
        Ok(self.inner.lock_event_metadata(&config.id()).await?)
    }

    async fn update_metadata(&mut self, metadata: &EventMetadata) -> Result<(), RepositoryError> {
        self.inner
            .upsert_event_metadata(metadata)
            .await
            .map_err(|e| map_write_error(&metadata.config, e))
    }

    async fn delete(
        &mut self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError> {
        self.inner
            .delete_event_metadata(&config.id(), event_id)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.inner.commit().await?;
        Ok(())
    }
}
