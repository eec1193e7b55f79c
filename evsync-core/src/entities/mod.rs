pub mod account;
pub mod config;
pub mod event;
pub mod event_metadata;

pub use account::{Account, AccountState, Session, SessionState};
pub use config::{EventManagerConfig, ListenerType};
pub use event::{Action, Event};
pub use event_metadata::{EventIdResponse, EventMetadata, EventsResponse, RefreshType, State};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(CompactString);

        impl $name {
            pub fn new(id: impl Into<CompactString>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value.into())
            }
        }

        impl From<CompactString> for $name {
            fn from(value: CompactString) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Id of a user account.
    UserId
);
string_id!(
    /// Opaque server-issued cursor of an event stream.
    EventId
);
string_id!(
    /// Id of an API session (`UID` on the wire).
    SessionId
);
