//! Engine settings.
//!
//! These are the validated runtime values shared by the scheduler and the
//! managers. Loading them from files is left to the binary.

mod engine;
mod settings_store;

pub use engine::EngineSettings;
pub use settings_store::{SettingsStore, SettingsWatcher};
