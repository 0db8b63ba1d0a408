//! Engine configuration, loaded from a RON file.

use crate::hooks::HookDefinition;
use crate::{Error, Result, DEFAULT_SOCKET_PATH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "shortcuts";

/// Static configuration for the engine and the daemon that hosts it.
///
/// Every field has a default, so an empty `()` document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Socket path for IPC communication
    pub socket_path: PathBuf,
    /// JSON file holding shortcuts and settings
    pub store_path: PathBuf,
    /// Directory receiving per-shortcut output logs; output is discarded when unset
    pub log_dir: Option<PathBuf>,
    /// Shell used to interpret command lines (invoked as `<shell> -c <cmd>`)
    pub shell: PathBuf,
    /// Upper bound for a single hook action, in seconds (0 disables the limit)
    pub hook_timeout_secs: u64,
    /// How often adopted processes are probed for liveness, in milliseconds
    pub adopt_poll_interval_ms: u64,
    /// Hook id to actions
    pub hooks: BTreeMap<String, HookDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            store_path: default_config_dir().join("shortcuts.json"),
            log_dir: None,
            shell: PathBuf::from("/bin/sh"),
            hook_timeout_secs: 30,
            adopt_poll_interval_ms: 1000,
            hooks: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a RON string
    pub fn from_ron(ron_str: &str) -> Result<Self> {
        Ok(ron::from_str(ron_str)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_ron(&content)
    }

    /// Load the configuration file if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Hook action timeout, `None` when disabled
    pub fn hook_timeout(&self) -> Option<Duration> {
        (self.hook_timeout_secs > 0).then(|| Duration::from_secs(self.hook_timeout_secs))
    }

    /// Liveness probe interval for adopted processes
    pub fn adopt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.adopt_poll_interval_ms.max(10))
    }

    /// Set the socket path
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the store path
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }
}

/// Directory holding the default config, store and logs
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default location of the RON configuration file
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.ron")
}
