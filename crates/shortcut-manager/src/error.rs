use thiserror::Error;

/// The main error type for shortcut-manager operations
#[derive(Error, Debug)]
pub enum Error {
    /// A launch was rejected because the shortcut is already running or launching
    #[error("Shortcut {0} is already running")]
    AlreadyRunning(String),

    /// The command could not be started
    #[error("Failed to start command: {0}")]
    Spawn(String),

    /// A hook could not be resolved or a pre-execution action failed
    #[error("Hook error: {0}")]
    Hook(String),

    /// The shortcut has no running process
    #[error("Shortcut {0} is not running")]
    NotRunning(String),

    /// Signalling the process failed
    #[error("Failed to kill process: {0}")]
    Kill(String),

    /// No shortcut with this id exists in the store
    #[error("Unknown shortcut: {0}")]
    UnknownShortcut(String),

    /// The persistence backend failed or could not be reached
    #[error("Store error: {0}")]
    Store(String),

    /// Error in IPC communication
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO-related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<ron::error::SpannedError> for Error {
    fn from(err: ron::error::SpannedError) -> Self {
        Error::Config(err.to_string())
    }
}
