//! Inter-Process Communication (IPC) between the daemon and its front ends.
//!
//! The daemon owns the [`ExecutionManager`] and the store. Front ends connect
//! over a Unix domain socket, issue requests and receive responses. A client
//! that subscribes to a shortcut also receives that shortcut's lifecycle
//! events, and every client receives toasts, pushed asynchronously between
//! responses.
//!
//! Messages are JSON, each prefixed with a 4-byte big-endian length.

use crate::broadcast::Event;
use crate::lifecycle::HostAppSignals;
use crate::manager::ExecutionManager;
use crate::shortcut::{Shortcut, ShortcutsDictionary};
use crate::store::Store;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Frames larger than this are rejected
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// How long a disconnecting client's queued messages get to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Requests a front end can send to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IPCRequest {
    /// The whole shortcut dictionary
    ListShortcuts,
    /// Replace the dictionary
    SetShortcuts { shortcuts: ShortcutsDictionary },
    AddShortcut { shortcut: Shortcut },
    ModShortcut { shortcut: Shortcut },
    RemoveShortcut { id: String },
    /// Read a setting, falling back to `default` (or null) when unset
    GetSetting {
        key: String,
        default: Option<serde_json::Value>,
    },
    SetSetting {
        key: String,
        value: serde_json::Value,
    },
    /// Launch a stored shortcut, appending `-flag value` pairs to its command
    Launch {
        id: String,
        flags: Vec<(String, String)>,
    },
    Kill { id: String },
    IsRunning { id: String },
    /// Ids of all running shortcuts
    Running,
    /// Start receiving the lifecycle events of a shortcut on this connection
    Subscribe { id: String },
    Unsubscribe { id: String },
    /// The host reports that the app launched for `id` closed
    AppEnded { id: String, status: i32 },
    /// A front-end log line, recorded under the `frontend` target
    Log { level: String, message: String },
    /// Stop the daemon
    Shutdown,
}

/// Messages sent from the daemon to a front end.
///
/// `Success` and `Error` answer requests in order; `Event` and `Toast` may
/// arrive at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IPCResponse {
    Success {
        message: String,
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
    /// Lifecycle event of a subscribed shortcut
    Event(Event),
    /// User-visible message raised by the engine
    Toast { title: String, message: String },
}

impl IPCResponse {
    fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        IPCResponse::Success {
            message: message.into(),
            data,
        }
    }

    fn is_push(&self) -> bool {
        matches!(self, IPCResponse::Event(_) | IPCResponse::Toast { .. })
    }
}

/// Push channels of all connected clients
pub type EventSenders = Arc<Mutex<Vec<mpsc::UnboundedSender<IPCResponse>>>>;

/// A toast sink that forwards to every connected IPC client.
///
/// Use it as the manager's notifier, with the same senders handed to
/// [`IPCServer::with_event_senders`].
pub fn create_toast_forwarder(
    event_senders: EventSenders,
) -> impl Fn(&str, &str) -> Result<()> + Send + Sync + 'static {
    move |title, message| {
        info!(target: "toast", "{}: {}", title, message);
        let mut senders = event_senders.lock();
        senders.retain(|tx| {
            tx.send(IPCResponse::Toast {
                title: title.to_string(),
                message: message.to_string(),
            })
            .is_ok()
        });
        Ok(())
    }
}

/// Write one length-prefixed JSON frame
pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    let len = u32::try_from(data.len())
        .map_err(|_| Error::Ipc(format!("message of {} bytes is too large", data.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame; `None` on a clean end of stream
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("frame of {len} bytes exceeds limit")));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// IPC server exposing an [`ExecutionManager`] and a [`Store`].
///
/// Serves any number of clients concurrently until a client sends
/// [`IPCRequest::Shutdown`].
pub struct IPCServer {
    socket_path: PathBuf,
    manager: ExecutionManager,
    store: Arc<dyn Store>,
    signals: Arc<HostAppSignals>,
    event_senders: EventSenders,
    shutdown: Arc<Notify>,
}

impl IPCServer {
    /// `signals` must be the lifecycle the manager was built with, so that
    /// [`IPCRequest::AppEnded`] reaches its watchers.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        manager: ExecutionManager,
        store: Arc<dyn Store>,
        signals: Arc<HostAppSignals>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            manager,
            store,
            signals,
            event_senders: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register clients with these senders, so a forwarder built on them reaches them
    pub fn with_event_senders(mut self, event_senders: EventSenders) -> Self {
        self.event_senders = event_senders;
        self
    }

    pub fn event_senders(&self) -> EventSenders {
        self.event_senders.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// A handle that stops [`run`](Self::run) when notified
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept and serve clients until shutdown.
    ///
    /// A stale socket file at the path is removed before binding, and the
    /// socket file is removed again on exit.
    pub async fn run(self) -> Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::Ipc(format!("Failed to bind {}: {e}", self.socket_path.display()))
        })?;
        info!("IPC server listening on {}", self.socket_path.display());

        let context = Arc::new(SessionContext {
            manager: self.manager.clone(),
            store: self.store.clone(),
            signals: self.signals.clone(),
            event_senders: self.event_senders.clone(),
            shutdown: self.shutdown.clone(),
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    debug!("Client connected");
                    let context = context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, context).await {
                            warn!("Client error: {}", e);
                        }
                        debug!("Client disconnected");
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown requested, closing IPC server");
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove socket file: {}", e);
        }
        Ok(())
    }
}

/// What every client session shares
struct SessionContext {
    manager: ExecutionManager,
    store: Arc<dyn Store>,
    signals: Arc<HostAppSignals>,
    event_senders: EventSenders,
    shutdown: Arc<Notify>,
}

/// Per-connection state: the push channel and the event forwarders it owns
struct Session {
    context: Arc<SessionContext>,
    push: mpsc::UnboundedSender<IPCResponse>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, forwarder) in self.subscriptions.drain() {
            forwarder.abort();
        }
    }
}

/// Serve one client: answer requests in order and forward pushes between them
async fn handle_client(stream: UnixStream, context: Arc<SessionContext>) -> Result<()> {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<IPCResponse>();
    context.event_senders.lock().push(push_tx.clone());

    let (mut reader, mut writer) = stream.into_split();

    // A single writer keeps frames whole
    let mut writer_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(response) = resp_rx.recv() => response,
                Some(push) = push_rx.recv() => push,
                else => break,
            };
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!("Failed to write to client: {}", e);
                break;
            }
        }
    });

    let mut session = Session {
        context: context.clone(),
        push: push_tx.clone(),
        subscriptions: HashMap::new(),
    };

    let mut shutdown = false;
    let result = async {
        while let Some(request) = read_frame::<_, IPCRequest>(&mut reader).await? {
            debug!("Request: {:?}", request);
            let is_shutdown = matches!(request, IPCRequest::Shutdown);
            let response = session.handle(request).await;
            if resp_tx.send(response).is_err() {
                break;
            }
            if is_shutdown {
                shutdown = true;
                break;
            }
        }
        Ok::<_, Error>(())
    }
    .await;

    // Close every sender so the writer drains what is queued and stops
    drop(session);
    drop(resp_tx);
    context
        .event_senders
        .lock()
        .retain(|tx| !tx.same_channel(&push_tx) && !tx.is_closed());
    drop(push_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }

    if shutdown {
        context.shutdown.notify_one();
    }
    result
}

impl Session {
    async fn handle(&mut self, request: IPCRequest) -> IPCResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => IPCResponse::Error {
                message: e.to_string(),
            },
        }
    }

    async fn dispatch(&mut self, request: IPCRequest) -> Result<IPCResponse> {
        let store = &self.context.store;
        let manager = &self.context.manager;
        Ok(match request {
            IPCRequest::ListShortcuts => {
                let shortcuts = store.get_shortcuts()?;
                IPCResponse::ok(
                    format!("Found {} shortcuts", shortcuts.len()),
                    Some(serde_json::to_value(shortcuts)?),
                )
            }
            IPCRequest::SetShortcuts { shortcuts } => {
                let updated = store.set_shortcuts(shortcuts)?;
                IPCResponse::ok("Shortcuts replaced", Some(serde_json::to_value(updated)?))
            }
            IPCRequest::AddShortcut { shortcut } => {
                let id = shortcut.id.clone();
                let updated = store.add_shortcut(shortcut)?;
                IPCResponse::ok(
                    format!("Added shortcut {id}"),
                    Some(serde_json::to_value(updated)?),
                )
            }
            IPCRequest::ModShortcut { shortcut } => {
                let id = shortcut.id.clone();
                let updated = store.mod_shortcut(shortcut)?;
                IPCResponse::ok(
                    format!("Updated shortcut {id}"),
                    Some(serde_json::to_value(updated)?),
                )
            }
            IPCRequest::RemoveShortcut { id } => {
                let updated = store.remove_shortcut(&id)?;
                IPCResponse::ok(
                    format!("Removed shortcut {id}"),
                    Some(serde_json::to_value(updated)?),
                )
            }
            IPCRequest::GetSetting { key, default } => {
                let value = store.get_setting(&key, default.unwrap_or(serde_json::Value::Null))?;
                IPCResponse::ok(key, Some(value))
            }
            IPCRequest::SetSetting { key, value } => {
                store.set_setting(&key, value)?;
                IPCResponse::ok(format!("Set {key}"), None)
            }
            IPCRequest::Launch { id, flags } => {
                let shortcut = store.get_shortcut(&id)?;
                let handle = manager.launch_or_toast(&shortcut, &flags).await?;
                IPCResponse::ok(
                    format!("Launched {id}"),
                    Some(serde_json::json!({ "pid": handle.pid() })),
                )
            }
            IPCRequest::Kill { id } => {
                manager.kill_or_toast(&id).await?;
                IPCResponse::ok(format!("Killed {id}"), None)
            }
            IPCRequest::IsRunning { id } => {
                let running = manager.is_running(&id);
                IPCResponse::ok(id, Some(serde_json::Value::Bool(running)))
            }
            IPCRequest::Running => {
                let running = manager.running();
                IPCResponse::ok(
                    format!("{} running", running.len()),
                    Some(serde_json::to_value(running)?),
                )
            }
            IPCRequest::Subscribe { id } => {
                if !self.subscriptions.contains_key(&id) {
                    let push = self.push.clone();
                    let forwarder = manager.on_event(&id, move |event| {
                        let _ = push.send(IPCResponse::Event(event.clone()));
                    });
                    self.subscriptions.insert(id.clone(), forwarder);
                }
                IPCResponse::ok(format!("Subscribed to {id}"), None)
            }
            IPCRequest::Unsubscribe { id } => {
                if let Some(forwarder) = self.subscriptions.remove(&id) {
                    forwarder.abort();
                }
                IPCResponse::ok(format!("Unsubscribed from {id}"), None)
            }
            IPCRequest::AppEnded { id, status } => {
                let delivered = self.context.signals.app_ended(&id, status);
                IPCResponse::ok(
                    format!("App ended for {id}"),
                    Some(serde_json::Value::Bool(delivered)),
                )
            }
            IPCRequest::Log { level, message } => {
                match level.to_ascii_lowercase().as_str() {
                    "error" => error!(target: "frontend", "{}", message),
                    "warn" | "warning" => warn!(target: "frontend", "{}", message),
                    "debug" => debug!(target: "frontend", "{}", message),
                    _ => info!(target: "frontend", "{}", message),
                }
                IPCResponse::ok("Logged", None)
            }
            IPCRequest::Shutdown => IPCResponse::ok("Shutting down", None),
        })
    }
}

/// IPC client for a shortcut daemon.
pub struct IPCClient {
    socket_path: PathBuf,
}

impl IPCClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Connect to the server. The server must already be listening.
    pub async fn connect(&self) -> Result<IPCConnection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Ipc(format!("Failed to connect to {}: {e}", self.socket_path.display()))
        })?;
        Ok(IPCConnection {
            stream,
            pending: VecDeque::new(),
        })
    }
}

/// An active connection to the daemon.
///
/// Pushes that arrive while a request is waiting for its answer are kept and
/// handed out by [`recv_event`](Self::recv_event) in arrival order.
pub struct IPCConnection {
    stream: UnixStream,
    pending: VecDeque<IPCResponse>,
}

impl IPCConnection {
    async fn recv_frame(&mut self) -> Result<IPCResponse> {
        read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| Error::Ipc("Server closed the connection".to_string()))
    }

    /// Send a request and wait for its answer, returning the answer's data
    pub async fn request(&mut self, request: &IPCRequest) -> Result<Option<serde_json::Value>> {
        write_frame(&mut self.stream, request).await?;
        loop {
            match self.recv_frame().await? {
                IPCResponse::Success { data, .. } => return Ok(data),
                IPCResponse::Error { message } => return Err(Error::Ipc(message)),
                push => self.pending.push_back(push),
            }
        }
    }

    async fn request_as<T: DeserializeOwned>(&mut self, request: &IPCRequest) -> Result<T> {
        let data = self.request(request).await?.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    pub async fn list_shortcuts(&mut self) -> Result<ShortcutsDictionary> {
        self.request_as(&IPCRequest::ListShortcuts).await
    }

    pub async fn set_shortcuts(
        &mut self,
        shortcuts: ShortcutsDictionary,
    ) -> Result<ShortcutsDictionary> {
        self.request_as(&IPCRequest::SetShortcuts { shortcuts }).await
    }

    pub async fn add_shortcut(&mut self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        self.request_as(&IPCRequest::AddShortcut { shortcut }).await
    }

    pub async fn mod_shortcut(&mut self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        self.request_as(&IPCRequest::ModShortcut { shortcut }).await
    }

    pub async fn remove_shortcut(&mut self, id: &str) -> Result<ShortcutsDictionary> {
        self.request_as(&IPCRequest::RemoveShortcut { id: id.to_string() })
            .await
    }

    pub async fn get_setting(
        &mut self,
        key: &str,
        default: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.request_as(&IPCRequest::GetSetting {
            key: key.to_string(),
            default,
        })
        .await
    }

    pub async fn set_setting(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.request(&IPCRequest::SetSetting {
            key: key.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    /// Launch a stored shortcut, returning the pid of its process
    pub async fn launch(&mut self, id: &str, flags: Vec<(String, String)>) -> Result<u32> {
        #[derive(Deserialize)]
        struct Launched {
            pid: u32,
        }
        let launched: Launched = self
            .request_as(&IPCRequest::Launch {
                id: id.to_string(),
                flags,
            })
            .await?;
        Ok(launched.pid)
    }

    pub async fn kill(&mut self, id: &str) -> Result<()> {
        self.request(&IPCRequest::Kill { id: id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn is_running(&mut self, id: &str) -> Result<bool> {
        self.request_as(&IPCRequest::IsRunning { id: id.to_string() })
            .await
    }

    pub async fn running(&mut self) -> Result<Vec<String>> {
        self.request_as(&IPCRequest::Running).await
    }

    pub async fn subscribe(&mut self, id: &str) -> Result<()> {
        self.request(&IPCRequest::Subscribe { id: id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&mut self, id: &str) -> Result<()> {
        self.request(&IPCRequest::Unsubscribe { id: id.to_string() })
            .await?;
        Ok(())
    }

    /// Report that the app for `id` closed; true if a running app was waiting for it
    pub async fn app_ended(&mut self, id: &str, status: i32) -> Result<bool> {
        self.request_as(&IPCRequest::AppEnded {
            id: id.to_string(),
            status,
        })
        .await
    }

    pub async fn log(&mut self, level: &str, message: &str) -> Result<()> {
        self.request(&IPCRequest::Log {
            level: level.to_string(),
            message: message.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Ask the daemon to stop
    pub async fn shutdown(&mut self) -> Result<()> {
        self.request(&IPCRequest::Shutdown).await?;
        Ok(())
    }

    /// Receive the next pushed event or toast, waiting if none is buffered
    pub async fn recv_event(&mut self) -> Result<IPCResponse> {
        if let Some(push) = self.pending.pop_front() {
            return Ok(push);
        }
        loop {
            let message = self.recv_frame().await?;
            if message.is_push() {
                return Ok(message);
            }
            warn!("Discarding unsolicited response: {:?}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventKind;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = IPCRequest::Launch {
            id: "s1".to_string(),
            flags: vec![("t".to_string(), "5".to_string())],
        };
        write_frame(&mut a, &request).await.unwrap();
        let received: Option<IPCRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(received, Some(request));

        drop(a);
        let eof: Option<IPCRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let result: Result<Option<IPCRequest>> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[test]
    fn test_event_push_wire_format() {
        let push = IPCResponse::Event(Event::new("s1", EventKind::End { status: 0 }));
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Event": {"shortcutId": "s1", "type": "end", "status": 0}})
        );
        assert!(push.is_push());
    }

    #[test]
    fn test_toast_forwarder_prunes_closed_clients() {
        let senders: EventSenders = Arc::new(Mutex::new(Vec::new()));
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);
        senders.lock().extend([open_tx, closed_tx]);

        let forward = create_toast_forwarder(senders.clone());
        forward("Error", "Shortcut failed. Check the command.").unwrap();

        assert_eq!(senders.lock().len(), 1);
        assert_eq!(
            open_rx.try_recv().unwrap(),
            IPCResponse::Toast {
                title: "Error".to_string(),
                message: "Shortcut failed. Check the command.".to_string(),
            }
        );
    }
}
