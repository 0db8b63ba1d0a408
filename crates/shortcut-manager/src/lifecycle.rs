//! "App ended" signals for shortcuts whose lifetime the host tracks.
//!
//! An app shortcut may hand off to a process outside the tree we spawned, so
//! its own exit says nothing about whether the app is still open. The host
//! reports the end instead.

use crate::process::ExitSignal;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Source of terminal "ended" notifications for app shortcuts
pub trait AppLifecycle: Send + Sync {
    /// Register interest in the end of the app launched for `shortcut_id`.
    ///
    /// The returned signal fires at most once, with the status the host reported.
    fn watch(&self, shortcut_id: &str) -> ExitSignal;
}

/// Lifecycle fed by the host calling [`HostAppSignals::app_ended`].
#[derive(Debug, Default)]
pub struct HostAppSignals {
    watchers: Mutex<HashMap<String, Vec<oneshot::Sender<i32>>>>,
}

impl HostAppSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that the app for `shortcut_id` closed.
    ///
    /// Returns false if nothing was watching that shortcut.
    pub fn app_ended(&self, shortcut_id: &str, status: i32) -> bool {
        let Some(watchers) = self.watchers.lock().remove(shortcut_id) else {
            debug!("App ended for {} with no watcher", shortcut_id);
            return false;
        };
        let mut delivered = false;
        for tx in watchers {
            delivered |= tx.send(status).is_ok();
        }
        delivered
    }
}

impl AppLifecycle for HostAppSignals {
    fn watch(&self, shortcut_id: &str) -> ExitSignal {
        let (tx, signal) = ExitSignal::channel();
        let mut watchers = self.watchers.lock();
        // Runs that were killed drop their signal without the host ever reporting
        watchers.retain(|_, list| {
            list.retain(|tx| !tx.is_closed());
            !list.is_empty()
        });
        watchers
            .entry(shortcut_id.to_string())
            .or_default()
            .push(tx);
        signal
    }
}
