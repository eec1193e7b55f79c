//! Configuration module for evsync-runner.
//!
//! Handles loading the TOML file and turning it into engine settings and
//! the list of accounts to sync.

pub mod file;

use crate::config::file::{AccountConfig, FileConfig, SyncConfig};
use evsync_core::config::EngineSettings;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: Url,
    pub app_version: Option<String>,
    pub timeout: Duration,
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub api: ApiSettings,
    pub engine: EngineSettings,
    pub foreground: bool,
    pub accounts: Vec<AccountConfig>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// Read, validate and convert the configuration file.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        parse(&config_content)
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }
}

fn parse(content: &str) -> Result<LoadedConfig, ConfigError> {
    let file_config: FileConfig = toml::from_str(content)?;
    validate(&file_config)?;

    let FileConfig { api, sync, accounts } = file_config;
    Ok(LoadedConfig {
        api: ApiSettings {
            base_url: with_trailing_slash(api.base_url),
            app_version: api.app_version,
            timeout: Duration::from_secs(api.timeout_secs),
        },
        engine: engine_settings(&sync),
        foreground: sync.foreground,
        accounts,
    })
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if !matches!(config.api.base_url.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "api.base_url must be http(s), got {}",
            config.api.base_url
        )));
    }
    if config.sync.repeat_interval_foreground_secs == 0
        || config.sync.repeat_interval_background_secs == 0
    {
        return Err(ConfigError::ValidationError(
            "sync repeat intervals must be positive".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for account in &config.accounts {
        if !seen.insert(&account.user_id) {
            return Err(ConfigError::ValidationError(format!(
                "account {} is listed twice",
                account.user_id
            )));
        }
        if account.session_id.is_empty()
            || account.access_token.is_empty()
            || account.refresh_token.is_empty()
        {
            return Err(ConfigError::ValidationError(format!(
                "account {} has an incomplete session",
                account.user_id
            )));
        }
    }
    Ok(())
}

/// `Url::join` drops the last segment of a base without a trailing slash.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn engine_settings(sync: &SyncConfig) -> EngineSettings {
    EngineSettings {
        min_fetch_interval: Duration::from_secs(sync.min_fetch_interval_secs),
        immediate_initial_delay: Duration::from_secs(sync.immediate_initial_delay_secs),
        repeat_interval_foreground: Duration::from_secs(sync.repeat_interval_foreground_secs),
        repeat_interval_background: Duration::from_secs(sync.repeat_interval_background_secs),
        backoff_delay: Duration::from_secs(sync.backoff_delay_secs),
    }
}
