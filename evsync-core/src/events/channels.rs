//! Event channel factories and handles.

use super::types::ProcessTick;
use tokio::sync::mpsc;

/// Default buffer size for event channels.
///
/// This provides enough buffer to handle bursts while keeping memory bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for ProcessTick events.
pub type ProcessTickSender = mpsc::Sender<ProcessTick>;
/// Receiver handle for ProcessTick events.
pub type ProcessTickReceiver = mpsc::Receiver<ProcessTick>;

/// Create a new ProcessTick channel.
///
/// The scheduler keeps clones of the sender; the runner owns the receiver.
pub fn process_tick_channel() -> (ProcessTickSender, ProcessTickReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
