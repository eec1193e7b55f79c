//! Persistence of event metadata.
//!
//! The repository owns the "one in-flight record per config" rule: writes
//! that would leave two non-completed records for the same config fail
//! with [`RepositoryError::Conflict`].

mod memory;
mod postgres;

pub use memory::InMemoryEventMetadataRepository;
pub use postgres::PgEventMetadataRepository;

use crate::entities::{EventId, EventManagerConfig, EventMetadata, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by metadata storage.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A second in-flight record was about to be written
    #[error("{config} already has an in-flight event metadata record")]
    Conflict { config: String },

    /// Backend refused the operation
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventMetadataRepository: Send + Sync {
    /// Records of one config, oldest first.
    async fn get(&self, config: &EventManagerConfig) -> Result<Vec<EventMetadata>, RepositoryError>;

    /// Records of every config owned by `user_id`, oldest first.
    async fn get_all(&self, user_id: &UserId) -> Result<Vec<EventMetadata>, RepositoryError>;

    /// Insert or replace the record identified by `(config, event_id)`.
    async fn update_metadata(&self, metadata: &EventMetadata) -> Result<(), RepositoryError>;

    /// Move the record at cursor `old` to cursor `new`.
    async fn update_event_id(
        &self,
        config: &EventManagerConfig,
        old: Option<&EventId>,
        new: &EventId,
    ) -> Result<(), RepositoryError>;

    async fn delete(
        &self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError>;

    async fn delete_all(&self, config: &EventManagerConfig) -> Result<(), RepositoryError>;

    /// Open a transaction. Dropping it without [`MetadataTransaction::commit`]
    /// discards every write made through it.
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, RepositoryError>;
}

#[async_trait]
pub trait MetadataTransaction: Send {
    async fn get(&mut self, config: &EventManagerConfig)
    -> Result<Vec<EventMetadata>, RepositoryError>;

    async fn update_metadata(&mut self, metadata: &EventMetadata) -> Result<(), RepositoryError>;

    async fn delete(
        &mut self,
        config: &EventManagerConfig,
        event_id: Option<&EventId>,
    ) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// The record a manager works on: the first in-flight one, otherwise the
/// newest completed one.
pub fn current_metadata(records: &[EventMetadata]) -> Option<&EventMetadata> {
    records
        .iter()
        .find(|m| !m.is_completed())
        .or_else(|| records.last())
}
