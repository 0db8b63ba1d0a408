//! Launch and supervise user-defined shell shortcuts.
//!
//! A shortcut is a named command line. The [`ExecutionManager`] starts it in
//! its own process group, wraps the run with the pre and post actions of its
//! hooks, tracks whether it is running and broadcasts its lifecycle events.
//! The [`Server`] exposes a manager and a persistent [`FileStore`] to front
//! ends over a Unix socket; [`Client`] connects to it.

pub mod broadcast;
pub mod client;
pub mod config;
mod error;
pub mod hooks;
pub mod ipc;
pub mod lifecycle;
pub mod manager;
pub mod notify;
pub mod process;
pub mod server;
pub mod shortcut;
pub mod state;
pub mod store;

pub use broadcast::{Event, EventBroadcaster, EventKind, Subscription};
pub use client::Client;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hooks::{HookDefinition, HookEngine};
pub use ipc::{IPCClient, IPCConnection, IPCRequest, IPCResponse, IPCServer};
pub use lifecycle::{AppLifecycle, HostAppSignals};
pub use manager::{ExecutionManager, ExecutionManagerBuilder};
pub use notify::{LogNotifier, Notifier};
pub use process::{CommandRunner, ProcessHandle, UNKNOWN_STATUS};
pub use server::{Server, run_server};
pub use shortcut::{Shortcut, ShortcutsDictionary};
pub use state::{RunStateEntry, RunStateTable};
pub use store::{FileStore, MemoryStore, SettingsStore, ShortcutStore, Store};

/// Default socket path for IPC communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shortcut-manager.sock";
