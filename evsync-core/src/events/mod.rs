//! Scheduling events.
//!
//! The worker scheduler emits `ProcessTick` when a config's job fires; the
//! worker runner consumes them and drives the matching `EventManager`.
//! Ticks only carry the config: managers re-read their metadata.

pub mod channels;
pub mod types;

pub use channels::{
    DEFAULT_CHANNEL_BUFFER, ProcessTickReceiver, ProcessTickSender, process_tick_channel,
};
pub use types::ProcessTick;
