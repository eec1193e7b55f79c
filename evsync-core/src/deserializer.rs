//! Per-source parsing of event stream responses.
//!
//! Each source kind knows its endpoint and the names of its cursor fields;
//! everything else about the batch is left in the raw response for
//! listeners. [`deserializer_for`] is the only place that dispatches on the
//! config kind.

use crate::entities::{
    EventId, EventIdResponse, EventManagerConfig, EventMetadata, EventsResponse, RefreshType,
};
use evsync_sdk::objects::events::{
    CORE_EVENTS_ENDPOINT, CalendarEventsBatch, CalendarLatestEventId, CoreEventsBatch,
    CoreLatestEventId, DriveEventsBatch, DriveLatestEventId, calendar_events_endpoint,
    drive_events_endpoint,
};
use time::OffsetDateTime;

pub trait EventDeserializer: Send + Sync {
    fn config(&self) -> &EventManagerConfig;

    /// Path of the stream, relative to the API root.
    fn endpoint(&self) -> &str;

    fn deserialize_latest_event_id(
        &self,
        response: &EventIdResponse,
    ) -> Result<EventId, serde_json::Error>;

    /// Parse the batch fetched at `event_id` into a fresh metadata record
    /// stamped with the fetch time.
    fn deserialize_event_metadata(
        &self,
        event_id: &EventId,
        response: &EventsResponse,
    ) -> Result<EventMetadata, serde_json::Error>;
}

pub fn deserializer_for(config: &EventManagerConfig) -> Box<dyn EventDeserializer> {
    match config {
        EventManagerConfig::Core { .. } => Box::new(CoreEventDeserializer {
            config: config.clone(),
        }),
        EventManagerConfig::Calendar { calendar_id, .. } => Box::new(CalendarEventDeserializer {
            config: config.clone(),
            endpoint: calendar_events_endpoint(calendar_id),
        }),
        EventManagerConfig::Drive { share_id, .. } => Box::new(DriveEventDeserializer {
            config: config.clone(),
            endpoint: drive_events_endpoint(share_id),
        }),
    }
}

fn batch_metadata(
    config: &EventManagerConfig,
    event_id: &EventId,
    response: &EventsResponse,
    next_event_id: String,
    refresh: i32,
    more: i32,
) -> EventMetadata {
    EventMetadata {
        event_id: Some(event_id.clone()),
        next_event_id: Some(EventId::from(next_event_id)),
        refresh: Some(RefreshType::from(refresh)),
        more: Some(more != 0),
        response: Some(response.clone()),
        fetched_at: Some(OffsetDateTime::now_utc()),
        ..EventMetadata::new(config.clone())
    }
}

pub struct CoreEventDeserializer {
    config: EventManagerConfig,
}

impl EventDeserializer for CoreEventDeserializer {
    fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    fn endpoint(&self) -> &str {
        CORE_EVENTS_ENDPOINT
    }

    fn deserialize_latest_event_id(
        &self,
        response: &EventIdResponse,
    ) -> Result<EventId, serde_json::Error> {
        let latest: CoreLatestEventId = serde_json::from_str(&response.body)?;
        Ok(EventId::from(latest.event_id))
    }

    fn deserialize_event_metadata(
        &self,
        event_id: &EventId,
        response: &EventsResponse,
    ) -> Result<EventMetadata, serde_json::Error> {
        let batch: CoreEventsBatch = serde_json::from_str(&response.body)?;
        Ok(batch_metadata(
            &self.config,
            event_id,
            response,
            batch.event_id,
            batch.refresh,
            batch.more,
        ))
    }
}

pub struct CalendarEventDeserializer {
    config: EventManagerConfig,
    endpoint: String,
}

impl EventDeserializer for CalendarEventDeserializer {
    fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn deserialize_latest_event_id(
        &self,
        response: &EventIdResponse,
    ) -> Result<EventId, serde_json::Error> {
        let latest: CalendarLatestEventId = serde_json::from_str(&response.body)?;
        Ok(EventId::from(latest.calendar_model_event_id))
    }

    fn deserialize_event_metadata(
        &self,
        event_id: &EventId,
        response: &EventsResponse,
    ) -> Result<EventMetadata, serde_json::Error> {
        let batch: CalendarEventsBatch = serde_json::from_str(&response.body)?;
        Ok(batch_metadata(
            &self.config,
            event_id,
            response,
            batch.calendar_model_event_id,
            batch.refresh,
            batch.more,
        ))
    }
}

pub struct DriveEventDeserializer {
    config: EventManagerConfig,
    endpoint: String,
}

impl EventDeserializer for DriveEventDeserializer {
    fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn deserialize_latest_event_id(
        &self,
        response: &EventIdResponse,
    ) -> Result<EventId, serde_json::Error> {
        let latest: DriveLatestEventId = serde_json::from_str(&response.body)?;
        Ok(EventId::from(latest.event_id))
    }

    fn deserialize_event_metadata(
        &self,
        event_id: &EventId,
        response: &EventsResponse,
    ) -> Result<EventMetadata, serde_json::Error> {
        let batch: DriveEventsBatch = serde_json::from_str(&response.body)?;
        Ok(batch_metadata(
            &self.config,
            event_id,
            response,
            batch.event_id,
            batch.refresh,
            batch.more,
        ))
    }
}
