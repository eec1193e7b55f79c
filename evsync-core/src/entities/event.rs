use serde::{Deserialize, Serialize};

/// What happened to an entity in an event batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Delete = 0,
    Create = 1,
    Update = 2,
    Partial = 3,
}

impl TryFrom<i32> for Action {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::Delete),
            1 => Ok(Action::Create),
            2 => Ok(Action::Update),
            3 => Ok(Action::Partial),
            other => Err(other),
        }
    }
}

/// A single entity change: `entity` is absent for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<K, T> {
    pub action: Action,
    pub key: K,
    pub entity: Option<T>,
}
