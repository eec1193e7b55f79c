use crate::entities::EventManagerConfig;

/// A scheduled job of `config` is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTick {
    pub config: EventManagerConfig,
}
