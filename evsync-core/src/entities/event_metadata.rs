use super::{EventId, EventManagerConfig, UserId};
use crate::framework::{DatabaseAccessor, DatabaseProcessor, TransactionProcessor};
use kanau::processor::Processor;
use time::OffsetDateTime;

/// Phase of one metadata record.
///
/// The pipeline order is the declaration order, but retries and failures
/// move records backwards (see `EventManager::process`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "event_state")]
pub enum State {
    Cancelled,
    Enqueued,
    Fetching,
    Persisted,
    NotifyResetAll,
    NotifyPrepare,
    NotifyEvents,
    Success,
    NotifySuccess,
    Failure,
    NotifyFailure,
    NotifyComplete,
    Completed,
}

/// Server hint about how much local state must be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshType {
    Nothing,
    Mail,
    Contact,
    All,
}

impl RefreshType {
    pub fn code(self) -> i32 {
        match self {
            RefreshType::Nothing => 0,
            RefreshType::Mail => 1,
            RefreshType::Contact => 2,
            RefreshType::All => 255,
        }
    }
}

impl From<i32> for RefreshType {
    /// Unknown non-zero values are treated as a full refresh.
    fn from(value: i32) -> Self {
        match value {
            0 => RefreshType::Nothing,
            1 => RefreshType::Mail,
            2 => RefreshType::Contact,
            _ => RefreshType::All,
        }
    }
}

/// Raw body of an event batch, kept so every phase sees the same payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsResponse {
    pub body: String,
}

/// Raw body of a `latest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdResponse {
    pub body: String,
}

/// Cursor progress of one config.
///
/// Records are replaced on every transition, never edited in place; use the
/// `with_*` helpers to derive the next version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub config: EventManagerConfig,
    pub event_id: Option<EventId>,
    pub next_event_id: Option<EventId>,
    pub refresh: Option<RefreshType>,
    pub more: Option<bool>,
    pub response: Option<EventsResponse>,
    pub retry: u32,
    pub state: State,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    pub fetched_at: Option<OffsetDateTime>,
}

impl EventMetadata {
    /// A fresh record with no cursor, ready to be fetched.
    pub fn new(config: EventManagerConfig) -> Self {
        Self {
            config,
            event_id: None,
            next_event_id: None,
            refresh: None,
            more: None,
            response: None,
            retry: 0,
            state: State::Enqueued,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            fetched_at: None,
        }
    }

    /// The record following `previous` in the cursor chain.
    pub fn chained_from(previous: &EventMetadata) -> Self {
        Self {
            event_id: previous.next_event_id.clone(),
            ..Self::new(previous.config.clone())
        }
    }

    pub fn user_id(&self) -> &UserId {
        self.config.user_id()
    }

    pub fn is_completed(&self) -> bool {
        self.state == State::Completed
    }

    pub fn with_state(&self, state: State) -> Self {
        Self {
            state,
            updated_at: Some(OffsetDateTime::now_utc()),
            ..self.clone()
        }
    }

    pub fn with_retry(&self, retry: u32) -> Self {
        Self {
            retry,
            updated_at: Some(OffsetDateTime::now_utc()),
            ..self.clone()
        }
    }

    pub fn with_event_id(&self, event_id: EventId) -> Self {
        Self {
            event_id: Some(event_id),
            updated_at: Some(OffsetDateTime::now_utc()),
            ..self.clone()
        }
    }

    pub fn with_next_event_id(&self, next_event_id: EventId) -> Self {
        Self {
            next_event_id: Some(next_event_id),
            updated_at: Some(OffsetDateTime::now_utc()),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Database access
// ---------------------------------------------------------------------------

const METADATA_COLUMNS: &str = "config, event_id, next_event_id, refresh, more, response, \
     retry, state, created_at, updated_at, fetched_at";

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventMetadataRow {
    config: sqlx::types::Json<EventManagerConfig>,
    event_id: Option<String>,
    next_event_id: Option<String>,
    refresh: Option<i32>,
    more: Option<bool>,
    response: Option<String>,
    retry: i32,
    state: State,
    created_at: OffsetDateTime,
    updated_at: Option<OffsetDateTime>,
    fetched_at: Option<OffsetDateTime>,
}

impl From<EventMetadataRow> for EventMetadata {
    fn from(row: EventMetadataRow) -> Self {
        Self {
            config: row.config.0,
            event_id: row.event_id.map(EventId::from),
            next_event_id: row.next_event_id.map(EventId::from),
            refresh: row.refresh.map(RefreshType::from),
            more: row.more,
            response: row.response.map(|body| EventsResponse { body }),
            retry: u32::try_from(row.retry).unwrap_or_default(),
            state: row.state,
            created_at: row.created_at,
            updated_at: row.updated_at,
            fetched_at: row.fetched_at,
        }
    }
}

#[derive(Debug, Clone)]
/// All records of one config, oldest first.
pub struct GetEventMetadataByConfig {
    pub config_key: String,
}

impl Processor<GetEventMetadataByConfig> for DatabaseProcessor {
    type Output = Vec<EventMetadata>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetEventMetadataByConfig")]
    async fn process(
        &self,
        query: GetEventMetadataByConfig,
    ) -> Result<Vec<EventMetadata>, sqlx::Error> {
        let rows = sqlx::query_as::<_, EventMetadataRow>(&format!(
            "SELECT {METADATA_COLUMNS} FROM event_metadata \
             WHERE config_key = $1 ORDER BY created_at, id"
        ))
        .bind(query.config_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone)]
/// All records of every config owned by a user.
pub struct GetEventMetadataByUser {
    pub user_id: UserId,
}

impl Processor<GetEventMetadataByUser> for DatabaseProcessor {
    type Output = Vec<EventMetadata>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetEventMetadataByUser")]
    async fn process(
        &self,
        query: GetEventMetadataByUser,
    ) -> Result<Vec<EventMetadata>, sqlx::Error> {
        let rows = sqlx::query_as::<_, EventMetadataRow>(&format!(
            "SELECT {METADATA_COLUMNS} FROM event_metadata \
             WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(query.user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

impl TransactionProcessor<'_> {
    /// Same as [`GetEventMetadataByConfig`] but row-locked until commit.
    #[tracing::instrument(skip_all, err, name = "SQL:LockEventMetadata")]
    pub async fn lock_event_metadata(
        &mut self,
        config_key: &str,
    ) -> Result<Vec<EventMetadata>, sqlx::Error> {
        let rows = sqlx::query_as::<_, EventMetadataRow>(&format!(
            "SELECT {METADATA_COLUMNS} FROM event_metadata \
             WHERE config_key = $1 ORDER BY created_at, id FOR UPDATE"
        ))
        .bind(config_key)
        .fetch_all(self.acquire())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Insert or replace the record identified by `(config, event_id)`.
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertEventMetadata")]
    pub async fn upsert_event_metadata(
        &mut self,
        metadata: &EventMetadata,
    ) -> Result<(), sqlx::Error> {
        let config_key = metadata.config.id();
        let event_id = metadata.event_id.as_ref().map(EventId::as_str);
        let next_event_id = metadata.next_event_id.as_ref().map(EventId::as_str);
        let refresh = metadata.refresh.map(RefreshType::code);
        let response = metadata.response.as_ref().map(|r| r.body.as_str());
        let retry = i32::try_from(metadata.retry).unwrap_or(i32::MAX);

        let updated = sqlx::query(
            r#"
            UPDATE event_metadata
            SET next_event_id = $3, refresh = $4, more = $5, response = $6,
                retry = $7, state = $8, updated_at = $9, fetched_at = $10
            WHERE config_key = $1 AND event_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(&config_key)
        .bind(event_id)
        .bind(next_event_id)
        .bind(refresh)
        .bind(metadata.more)
        .bind(response)
        .bind(retry)
        .bind(metadata.state)
        .bind(metadata.updated_at)
        .bind(metadata.fetched_at)
        .execute(self.acquire())
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO event_metadata
                    (user_id, config_key, config, event_id, next_event_id, refresh, more,
                     response, retry, state, created_at, updated_at, fetched_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(metadata.user_id().as_str())
            .bind(&config_key)
            .bind(sqlx::types::Json(&metadata.config))
            .bind(event_id)
            .bind(next_event_id)
            .bind(refresh)
            .bind(metadata.more)
            .bind(response)
            .bind(retry)
            .bind(metadata.state)
            .bind(metadata.created_at)
            .bind(metadata.updated_at)
            .bind(metadata.fetched_at)
            .execute(self.acquire())
            .await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ReplaceEventId")]
    pub async fn replace_event_id(
        &mut self,
        config_key: &str,
        old: Option<&EventId>,
        new: &EventId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE event_metadata SET event_id = $3, updated_at = now()
            WHERE config_key = $1 AND event_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(config_key)
        .bind(old.map(EventId::as_str))
        .bind(new.as_str())
        .execute(self.acquire())
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:DeleteEventMetadata")]
    pub async fn delete_event_metadata(
        &mut self,
        config_key: &str,
        event_id: Option<&EventId>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM event_metadata WHERE config_key = $1 AND event_id IS NOT DISTINCT FROM $2",
        )
        .bind(config_key)
        .bind(event_id.map(EventId::as_str))
        .execute(self.acquire())
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:DeleteAllEventMetadata")]
    pub async fn delete_all_event_metadata(&mut self, config_key: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM event_metadata WHERE config_key = $1")
            .bind(config_key)
            .execute(self.acquire())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EventManagerConfig {
        EventManagerConfig::core(UserId::from("user"))
    }

    #[test]
    fn test_refresh_type_codes() {
        assert_eq!(RefreshType::from(0), RefreshType::Nothing);
        assert_eq!(RefreshType::from(1), RefreshType::Mail);
        assert_eq!(RefreshType::from(2), RefreshType::Contact);
        assert_eq!(RefreshType::from(255), RefreshType::All);
        assert_eq!(RefreshType::from(64), RefreshType::All);
        assert_eq!(RefreshType::All.code(), 255);
    }

    #[test]
    fn test_chained_record_starts_at_previous_next_cursor() {
        let completed = EventMetadata {
            event_id: Some(EventId::from("1")),
            next_event_id: Some(EventId::from("2")),
            retry: 4,
            more: Some(true),
            ..EventMetadata::new(config())
        }
        .with_state(State::Completed);

        let next = EventMetadata::chained_from(&completed);
        assert_eq!(next.event_id, Some(EventId::from("2")));
        assert_eq!(next.next_event_id, None);
        assert_eq!(next.retry, 0);
        assert_eq!(next.state, State::Enqueued);
        assert_eq!(next.more, None);
    }

    #[test]
    fn test_with_helpers_leave_original_untouched() {
        let original = EventMetadata::new(config());
        let next = original.with_state(State::Fetching).with_retry(2);
        assert_eq!(original.state, State::Enqueued);
        assert_eq!(original.retry, 0);
        assert_eq!(next.state, State::Fetching);
        assert_eq!(next.retry, 2);
        assert!(next.updated_at.is_some());
    }
}
