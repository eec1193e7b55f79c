use std::time::Duration;

/// Timing knobs of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// A fetch is skipped when the previous one happened less than this ago.
    pub min_fetch_interval: Duration,
    /// Initial delay of an immediate enqueue.
    pub immediate_initial_delay: Duration,
    /// Initial delay of a regular enqueue while the app is in foreground.
    pub repeat_interval_foreground: Duration,
    /// Initial delay in background, and the period of every job.
    pub repeat_interval_background: Duration,
    /// First retry delay after a failed run; doubles on each failure.
    pub backoff_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_fetch_interval: Duration::ZERO,
            immediate_initial_delay: Duration::ZERO,
            repeat_interval_foreground: Duration::from_secs(30),
            repeat_interval_background: Duration::from_secs(30 * 60),
            backoff_delay: Duration::from_secs(30),
        }
    }
}
