use super::UserId;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Identifies one independent event stream.
///
/// Distinct configs never share metadata, listeners or scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventManagerConfig {
    Core {
        user_id: UserId,
    },
    Calendar {
        user_id: UserId,
        calendar_id: CompactString,
    },
    Drive {
        user_id: UserId,
        share_id: CompactString,
    },
}

/// Which group of listeners a config notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerType {
    Core,
    Calendar,
    Drive,
}

impl EventManagerConfig {
    pub fn core(user_id: UserId) -> Self {
        Self::Core { user_id }
    }

    pub fn calendar(user_id: UserId, calendar_id: impl Into<CompactString>) -> Self {
        Self::Calendar {
            user_id,
            calendar_id: calendar_id.into(),
        }
    }

    pub fn drive(user_id: UserId, share_id: impl Into<CompactString>) -> Self {
        Self::Drive {
            user_id,
            share_id: share_id.into(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Core { user_id } => user_id,
            Self::Calendar { user_id, .. } => user_id,
            Self::Drive { user_id, .. } => user_id,
        }
    }

    pub fn listener_type(&self) -> ListenerType {
        match self {
            Self::Core { .. } => ListenerType::Core,
            Self::Calendar { .. } => ListenerType::Calendar,
            Self::Drive { .. } => ListenerType::Drive,
        }
    }

    /// Stable key used for storage and logs.
    pub fn id(&self) -> String {
        match self {
            Self::Core { user_id } => format!("core:{user_id}"),
            Self::Calendar {
                user_id,
                calendar_id,
            } => format!("calendar:{user_id}:{calendar_id}"),
            Self::Drive { user_id, share_id } => format!("drive:{user_id}:{share_id}"),
        }
    }
}

impl std::fmt::Display for EventManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}
