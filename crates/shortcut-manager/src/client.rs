use crate::ipc::{IPCClient, IPCConnection};
use crate::{DEFAULT_SOCKET_PATH, Error, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// How to start a daemon when none is listening
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerCommand {
    program: PathBuf,
    args: Vec<String>,
}

/// A client for connecting to a shortcut daemon.
///
/// The client will attempt to connect to an existing daemon at the configured
/// socket path. If none is listening and a server command is configured, it
/// starts one and waits for it to come up.
///
/// # Server Spawning
///
/// By default, the client will only connect to existing servers. To enable
/// automatic spawning, use one of these methods:
///
/// - [`with_auto_spawn_server()`](Self::with_auto_spawn_server) - Uses the current executable with the `daemon` subcommand
/// - [`with_server_command()`](Self::with_server_command) - Uses a custom command
///
/// A spawned daemon is detached from the client and keeps running after the
/// client exits.
pub struct Client {
    /// Socket path for IPC communication
    socket_path: PathBuf,
    /// Optional server command (if None, won't spawn server)
    server_command: Option<ServerCommand>,
    /// How long to wait for server to be ready after spawning
    server_startup_timeout: Duration,
    /// How long to wait for initial connection
    connection_timeout: Duration,
    /// Number of connection attempts before giving up
    max_connection_attempts: u32,
    /// Delay between connection attempts
    connection_retry_delay: Duration,
    /// PID of the daemon this client started, if any
    spawned_pid: Option<u32>,
    /// The active IPC connection (if connected)
    connection: Option<IPCConnection>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Create a new client with default configuration
    pub fn new() -> Self {
        Self::new_with_socket(DEFAULT_SOCKET_PATH)
    }

    /// Create a new client with the given socket path
    pub fn new_with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            server_command: None,
            server_startup_timeout: Duration::from_millis(2000),
            connection_timeout: Duration::from_secs(5),
            max_connection_attempts: 5,
            connection_retry_delay: Duration::from_millis(200),
            spawned_pid: None,
            connection: None,
        }
    }

    /// Set the socket path
    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    /// Enable automatic server spawning using the current executable.
    ///
    /// The daemon is started as `<current exe> daemon` followed by `extra_args`.
    pub fn with_auto_spawn_server<I, A>(mut self, extra_args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        match std::env::current_exe() {
            Ok(current_exe) => {
                let args = std::iter::once("daemon".to_string())
                    .chain(extra_args.into_iter().map(|a| a.as_ref().to_string()))
                    .collect();
                self.server_command = Some(ServerCommand {
                    program: current_exe,
                    args,
                });
            }
            Err(e) => warn!("Cannot locate current executable, auto-spawn disabled: {}", e),
        }
        self
    }

    /// Set a custom server command for automatic spawning.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to run (e.g., "/path/to/shortcuts")
    /// * `args` - Arguments to pass to the server command
    pub fn with_server_command<S, I, A>(mut self, command: S, args: I) -> Self
    where
        S: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        self.server_command = Some(ServerCommand {
            program: command.into(),
            args: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
        });
        self
    }

    /// Set the server startup timeout
    pub fn with_server_startup_timeout(mut self, timeout: Duration) -> Self {
        self.server_startup_timeout = timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the maximum number of connection attempts
    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    /// Set the delay between connection retry attempts
    pub fn with_connection_retry_delay(mut self, delay: Duration) -> Self {
        self.connection_retry_delay = delay;
        self
    }

    /// Connect to the server, optionally spawning it first
    pub async fn connect(mut self) -> Result<Self> {
        if self.connection.is_some() {
            debug!("Already connected to server");
            return Ok(self);
        }

        info!(
            "Attempting to connect to existing server at {}",
            self.socket_path.display()
        );
        match self.try_connect().await {
            Ok(connection) => {
                info!("Connected to existing server");
                self.connection = Some(connection);
                return Ok(self);
            }
            Err(e) => {
                debug!("Failed to connect to existing server: {}", e);
            }
        }

        let Some(command) = self.server_command.clone() else {
            return Err(Error::Ipc(format!(
                "No server running at {} and auto-spawn is disabled",
                self.socket_path.display()
            )));
        };

        info!("No existing server found, spawning new server");
        let pid = spawn_detached(&command)?;
        self.spawned_pid = Some(pid);

        debug!(
            "Polling for server readiness (timeout: {:?})",
            self.server_startup_timeout
        );
        let start_time = tokio::time::Instant::now();
        let mut poll_interval = Duration::from_millis(10);
        loop {
            match self.try_connect().await {
                Ok(connection) => {
                    info!(
                        "Successfully connected to spawned server in {:?}",
                        start_time.elapsed()
                    );
                    self.connection = Some(connection);
                    return Ok(self);
                }
                Err(_) if start_time.elapsed() < self.server_startup_timeout => {
                    sleep(poll_interval).await;
                    if poll_interval < Duration::from_millis(100) {
                        poll_interval = poll_interval.saturating_add(Duration::from_millis(10));
                    }
                }
                Err(_) => break,
            }
        }

        debug!("Server startup timeout reached, trying with retries");
        match self.try_connect_with_retries().await {
            Ok(connection) => {
                info!("Successfully connected to spawned server");
                self.connection = Some(connection);
                Ok(self)
            }
            Err(e) => {
                error!("Failed to connect to spawned server (pid {}): {}", pid, e);
                Err(e)
            }
        }
    }

    /// Try to connect to the server once
    async fn try_connect(&self) -> Result<IPCConnection> {
        let client = IPCClient::new(&self.socket_path);

        match timeout(self.connection_timeout, client.connect()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Ipc(format!(
                "Connection timeout after {:?}",
                self.connection_timeout
            ))),
        }
    }

    /// Try to connect with retries
    async fn try_connect_with_retries(&self) -> Result<IPCConnection> {
        let mut last_error = None;

        for attempt in 1..=self.max_connection_attempts {
            debug!(
                "Connection attempt {}/{}",
                attempt, self.max_connection_attempts
            );

            match self.try_connect().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);

                    if attempt < self.max_connection_attempts {
                        sleep(self.connection_retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Ipc("Failed to connect after all retry attempts".to_string())
        }))
    }

    /// Get a reference to the connection
    pub fn connection(&mut self) -> Result<&mut IPCConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::Ipc("Not connected to server".to_string()))
    }

    /// Consume the client, keeping only its connection
    pub fn into_connection(self) -> Result<IPCConnection> {
        self.connection
            .ok_or_else(|| Error::Ipc("Not connected to server".to_string()))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the connection, asking the daemon to stop first if `stop_server` is set
    pub async fn disconnect(&mut self, stop_server: bool) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            if stop_server {
                info!("Stopping server");
                connection.shutdown().await?;
            }
        }
        Ok(())
    }

    /// PID of the daemon this client spawned.
    ///
    /// `None` if the client connected to an already running daemon.
    pub fn server_pid(&self) -> Option<u32> {
        self.spawned_pid
    }
}

/// Start the daemon in its own process group with no stdio
fn spawn_detached(command: &ServerCommand) -> Result<u32> {
    use std::os::unix::process::CommandExt;

    info!(
        "Spawning server: {} {}",
        command.program.display(),
        command.args.join(" ")
    );
    let child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| {
            Error::Ipc(format!(
                "Failed to spawn server {}: {e}",
                command.program.display()
            ))
        })?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder() {
        let client = Client::new_with_socket("/test/socket.sock")
            .with_max_connection_attempts(10)
            .with_server_startup_timeout(Duration::from_secs(2))
            .with_connection_timeout(Duration::from_secs(10))
            .with_connection_retry_delay(Duration::from_millis(500));

        assert_eq!(client.socket_path, PathBuf::from("/test/socket.sock"));
        assert_eq!(client.max_connection_attempts, 10);
        assert_eq!(client.server_startup_timeout, Duration::from_secs(2));
        assert_eq!(client.connection_timeout, Duration::from_secs(10));
        assert_eq!(client.connection_retry_delay, Duration::from_millis(500));
        assert!(client.server_command.is_none());
    }

    #[test]
    fn test_client_default_socket_path() {
        let client = Client::new();
        assert_eq!(client.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_auto_spawn_uses_daemon_subcommand() {
        let client = Client::new().with_auto_spawn_server(["--config", "/tmp/c.ron"]);
        let command = client.server_command.unwrap();
        assert_eq!(command.args, vec!["daemon", "--config", "/tmp/c.ron"]);
    }

    #[tokio::test]
    async fn test_connect_without_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Client::new_with_socket(dir.path().join("none.sock"))
            .connect()
            .await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
