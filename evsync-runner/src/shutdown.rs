//! Signal handling for graceful shutdown and config reload.

use crate::accounts::reconcile_accounts;
use crate::config::ConfigLoader;
use crate::config::file::AccountConfig;
use evsync_core::account::{AppLifecycle, AppLifecycleState, InMemoryAccountStore};
use evsync_core::config::{EngineSettings, SettingsStore};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Completes when a shutdown signal is received.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C).
pub async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

/// Everything a reload may change.
pub struct Reloadable {
    pub loader: Arc<ConfigLoader>,
    pub engine: SettingsStore<EngineSettings>,
    pub accounts: SettingsStore<Vec<AccountConfig>>,
    pub store: Arc<InMemoryAccountStore>,
    pub app_lifecycle: Arc<AppLifecycle>,
}

/// Spawns a task that reloads the configuration on SIGHUP until shutdown.
pub fn spawn_config_reload_handler(
    reloadable: Reloadable,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP, reloading configuration");
                    match reloadable.loader.reload() {
                        Ok(loaded) => {
                            reloadable.engine.update(loaded.engine);
                            reloadable.app_lifecycle.set(if loaded.foreground {
                                AppLifecycleState::Foreground
                            } else {
                                AppLifecycleState::Background
                            });

                            // Streams must be current before accounts are republished.
                            let previous = reloadable.accounts.current();
                            reloadable.accounts.update(loaded.accounts.clone());
                            reconcile_accounts(&reloadable.store, &previous, &loaded.accounts).await;

                            tracing::info!("Configuration reloaded successfully");
                        }
                        Err(e) => {
                            tracing::error!("Failed to reload configuration: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("Config reload handler shutting down");
                        break;
                    }
                }
            }
        }
    }))
}
