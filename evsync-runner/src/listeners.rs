//! Listeners installed by the runner.
//!
//! The daemon has no local store of its own; it reports every batch and
//! session change through `tracing`.

use async_trait::async_trait;
use evsync_core::entities::{EventManagerConfig, EventMetadata, ListenerType, Session};
use evsync_core::listener::EventListener;
use evsync_core::processors::EventManagerError;
use evsync_core::session::SessionListener;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Logs the phases of every batch of one listener type.
pub struct LoggingListener {
    listener_type: ListenerType,
}

impl LoggingListener {
    /// One listener per listener type.
    pub fn all() -> Vec<Arc<dyn EventListener>> {
        [ListenerType::Core, ListenerType::Calendar, ListenerType::Drive]
            .into_iter()
            .map(|listener_type| Arc::new(Self { listener_type }) as Arc<dyn EventListener>)
            .collect()
    }
}

#[async_trait]
impl EventListener for LoggingListener {
    fn listener_type(&self) -> ListenerType {
        self.listener_type
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    async fn notify_events(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        debug!(
            config = %metadata.config,
            event_id = ?metadata.event_id,
            bytes = metadata.response.as_ref().map_or(0, |r| r.body.len()),
            "Event batch received"
        );
        Ok(())
    }

    async fn notify_failure(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        warn!(config = %metadata.config, retry = metadata.retry, "Event batch failed");
        Ok(())
    }

    async fn notify_reset_all(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        info!(
            config = %metadata.config,
            refresh = ?metadata.refresh,
            "Event stream reset"
        );
        Ok(())
    }

    async fn notify_complete(&self, metadata: &EventMetadata) -> anyhow::Result<()> {
        info!(
            config = %metadata.config,
            next_event_id = ?metadata.next_event_id,
            more = ?metadata.more,
            "Event batch completed"
        );
        Ok(())
    }

    async fn on_fetch_error(&self, config: &EventManagerConfig, error: &EventManagerError) {
        warn!(config = %config, error = %error, "Event fetch failed");
    }
}

pub struct LoggingSessionListener;

#[async_trait]
impl SessionListener for LoggingSessionListener {
    async fn on_session_token_created(&self, session: &Session) {
        info!(session_id = %session.session_id, "Session created");
    }

    async fn on_session_token_refreshed(&self, session: &Session) {
        info!(session_id = %session.session_id, user_id = ?session.user_id, "Session refreshed");
    }

    async fn on_session_force_logout(&self, session: &Session, http_code: u16) {
        warn!(
            session_id = %session.session_id,
            user_id = ?session.user_id,
            http_code,
            "Session forced out"
        );
    }
}
