//! Event stream payloads.
//!
//! Every source exposes two calls: `{endpoint}/latest` returning the newest
//! cursor, and `{endpoint}/{eventId}` returning the batch that follows a
//! cursor. Only the fields shared by all consumers are modeled here; the
//! per-entity arrays stay in the raw body and are parsed by listeners.

use serde::{Deserialize, Serialize};

pub const CORE_EVENTS_ENDPOINT: &str = "core/v4/events";

pub fn calendar_events_endpoint(calendar_id: &str) -> String {
    format!(
        "calendar/v1/{}/modelevents",
        urlencoding::encode(calendar_id)
    )
}

pub fn drive_events_endpoint(share_id: &str) -> String {
    format!("drive/shares/{}/events", urlencoding::encode(share_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoreLatestEventId {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "EventID")]
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoreEventsBatch {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(default)]
    pub refresh: i32,
    #[serde(default)]
    pub more: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CalendarLatestEventId {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "CalendarModelEventID")]
    pub calendar_model_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CalendarEventsBatch {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "CalendarModelEventID")]
    pub calendar_model_event_id: String,
    #[serde(default)]
    pub refresh: i32,
    #[serde(default)]
    pub more: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriveLatestEventId {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "EventID")]
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriveEventsBatch {
    #[serde(default)]
    pub code: i32,
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(default)]
    pub refresh: i32,
    #[serde(default)]
    pub more: i32,
}

/// One entry of a per-entity array such as `Contacts` or `ContactEmails`.
///
/// The entity itself lives under a source-specific key, so it is left to the
/// caller to pick it out of `rest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityEvent {
    #[serde(rename = "ID")]
    pub id: String,
    pub action: i32,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_batch_parsing() {
        let body = r#"{
            "Code": 1000,
            "EventID": "ACXDmTaBub14w==",
            "Refresh": 0,
            "More": 1,
            "Contacts": [{"ID": "afeaefaeTaBub14w==", "Action": 1, "Contact": {"Name": "test"}}]
        }"#;
        let batch: CoreEventsBatch = serde_json::from_str(body).unwrap();
        assert_eq!(batch.code, 1000);
        assert_eq!(batch.event_id, "ACXDmTaBub14w==");
        assert_eq!(batch.refresh, 0);
        assert_eq!(batch.more, 1);
    }

    #[test]
    fn test_calendar_latest_parsing() {
        let body = r#"{"Code": 1000, "CalendarModelEventID": "cal-event"}"#;
        let latest: CalendarLatestEventId = serde_json::from_str(body).unwrap();
        assert_eq!(latest.calendar_model_event_id, "cal-event");
    }

    #[test]
    fn test_missing_cursor_is_an_error() {
        let body = r#"{"Code": 1000, "Refresh": 0, "More": 0}"#;
        assert!(serde_json::from_str::<DriveEventsBatch>(body).is_err());
    }

    #[test]
    fn test_entity_event_keeps_payload() {
        let body = r#"{"ID": "c1", "Action": 2, "Contact": {"Name": "n"}}"#;
        let event: EntityEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.id, "c1");
        assert_eq!(event.action, 2);
        assert!(event.rest.contains_key("Contact"));
    }

    #[test]
    fn test_endpoints_are_encoded() {
        assert_eq!(
            calendar_events_endpoint("a/b=="),
            "calendar/v1/a%2Fb%3D%3D/modelevents"
        );
        assert_eq!(drive_events_endpoint("share"), "drive/shares/share/events");
    }
}
