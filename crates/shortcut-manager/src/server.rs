use crate::config::EngineConfig;
use crate::ipc::{EventSenders, IPCServer, create_toast_forwarder};
use crate::lifecycle::HostAppSignals;
use crate::manager::ExecutionManager;
use crate::store::{FileStore, ShortcutStore};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The shortcut daemon: a file-backed store, an execution manager and the
/// IPC server that exposes them.
pub struct Server {
    config: EngineConfig,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Server {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the server on a fresh multi-threaded runtime, blocking until shutdown
    pub fn run_blocking(self) -> Result<()> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::Ipc(format!("Failed to create tokio runtime: {e}")))?;
        runtime.block_on(self.run())
    }

    /// Run the server
    ///
    /// This will:
    /// 1. Open the store at the configured path
    /// 2. Build the execution manager, forwarding toasts to IPC clients
    /// 3. Adopt shortcut processes left running by a previous daemon
    /// 4. Serve IPC clients until a client requests shutdown or the process
    ///    receives Ctrl-C
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting shortcut server on socket: {}",
            self.config.socket_path.display()
        );

        let store = Arc::new(FileStore::open(&self.config.store_path)?);
        info!("Using store {}", store.path().display());

        let signals = Arc::new(HostAppSignals::new());
        let event_senders: EventSenders = Arc::new(Mutex::new(Vec::new()));
        let manager = ExecutionManager::builder_from_config(&self.config)
            .notifier(Arc::new(create_toast_forwarder(event_senders.clone())))
            .lifecycle(signals.clone())
            .settings(store.clone())
            .build();

        match store.get_shortcuts().and_then(|s| manager.reconcile(&s)) {
            Ok(adopted) if !adopted.is_empty() => {
                info!("Adopted {} running shortcut(s)", adopted.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Reconciliation failed: {}", e),
        }

        let ipc_server = IPCServer::new(&self.config.socket_path, manager, store, signals)
            .with_event_senders(event_senders);

        let shutdown = ipc_server.shutdown_handle();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    shutdown.notify_one();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
        });

        ipc_server.run().await?;
        info!("Shortcut server stopped");
        Ok(())
    }
}

/// Run a server with the configuration at its default location
pub fn run_server() -> Result<()> {
    let config = EngineConfig::load_or_default(crate::config::default_config_path())?;
    Server::new(config).run_blocking()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::RUNNING_PIDS_KEY;
    use crate::shortcut::Shortcut;
    use crate::store::SettingsStore;
    use std::time::Duration;

    #[test]
    fn test_server_default_config() {
        let server = Server::default();
        assert_eq!(server.config().socket_path, EngineConfig::default().socket_path);
    }

    #[tokio::test]
    async fn test_server_cleans_up_socket_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let config = EngineConfig::default()
            .with_socket_path(&socket)
            .with_store_path(dir.path().join("store.json"));

        let server = tokio::spawn(Server::new(config).run());
        let mut connection = loop {
            if let Ok(c) = crate::ipc::IPCClient::new(&socket).connect().await {
                break c;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        connection.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_server_drops_stale_pid_records() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("store.json");
        {
            let store = FileStore::open(&store_path).unwrap();
            store
                .add_shortcut(Shortcut::script("S", "sleep 1").with_id("s1"))
                .unwrap();
            store
                .set_setting(RUNNING_PIDS_KEY, serde_json::json!({"s1": 999_999}))
                .unwrap();
        }
        let socket = dir.path().join("daemon.sock");
        let config = EngineConfig::default()
            .with_socket_path(&socket)
            .with_store_path(&store_path);

        let server = tokio::spawn(Server::new(config).run());
        let mut connection = loop {
            if let Ok(c) = crate::ipc::IPCClient::new(&socket).connect().await {
                break c;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(connection.running().await.unwrap().is_empty());
        assert_eq!(
            connection.get_setting(RUNNING_PIDS_KEY, None).await.unwrap(),
            serde_json::json!({})
        );
        connection.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }
}
