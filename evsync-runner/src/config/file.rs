//! TOML file configuration structures.
//!
//! These structs directly map to the `evsync.toml` file format.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Remote API section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API root, e.g. `https://mail.proton.me/api/`.
    pub base_url: Url,
    /// Sent as `x-pm-appversion`.
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Scheduling section. Every interval is in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Use the foreground intervals.
    pub foreground: bool,
    pub min_fetch_interval_secs: u64,
    pub immediate_initial_delay_secs: u64,
    pub repeat_interval_foreground_secs: u64,
    pub repeat_interval_background_secs: u64,
    pub backoff_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            foreground: true,
            min_fetch_interval_secs: 0,
            immediate_initial_delay_secs: 0,
            repeat_interval_foreground_secs: 30,
            repeat_interval_background_secs: 30 * 60,
            backoff_delay_secs: 30,
        }
    }
}

/// One synced account and the session it syncs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub user_id: CompactString,
    pub username: CompactString,
    pub session_id: CompactString,
    pub access_token: String,
    pub refresh_token: String,
    /// Calendars with their own event stream.
    #[serde(default)]
    pub calendars: Vec<CompactString>,
    /// Drive shares with their own event stream.
    #[serde(default)]
    pub shares: Vec<CompactString>,
}
