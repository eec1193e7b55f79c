//! Shared settings with change notification.
//!
//! `SettingsStore<T>` keeps the current value inside a `watch` channel, so
//! readers get a cheap snapshot and subscribers can await the next update
//! without polling.

use tokio::sync::watch;

/// A shared settings value that can be swapped at runtime.
#[derive(Clone)]
pub struct SettingsStore<T> {
    tx: std::sync::Arc<watch::Sender<T>>,
}

/// Receives notifications when a [`SettingsStore`] is updated.
pub struct SettingsWatcher<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> SettingsStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Snapshot of the current value.
    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the stored value and notify all watchers.
    pub fn update(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn subscribe(&self) -> SettingsWatcher<T> {
        SettingsWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> SettingsWatcher<T> {
    /// Wait for the next update and return the new value.
    ///
    /// Returns `Err` once every [`SettingsStore`] handle has been dropped.
    pub async fn changed(&mut self) -> Result<T, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
