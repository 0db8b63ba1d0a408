//! Persistence for shortcut definitions and settings.
//!
//! The engine only depends on the [`ShortcutStore`] and [`SettingsStore`]
//! traits. Every read returns an owned copy, so callers can never mutate the
//! authoritative dictionary in place.

use crate::shortcut::{Shortcut, ShortcutsDictionary};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Authoritative shortcut storage. Mutations return the updated dictionary.
pub trait ShortcutStore: Send + Sync {
    fn get_shortcuts(&self) -> Result<ShortcutsDictionary>;
    fn set_shortcuts(&self, shortcuts: ShortcutsDictionary) -> Result<ShortcutsDictionary>;
    fn add_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary>;
    fn mod_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary>;
    fn remove_shortcut(&self, id: &str) -> Result<ShortcutsDictionary>;

    /// Fetch a single shortcut
    fn get_shortcut(&self, id: &str) -> Result<Shortcut> {
        self.get_shortcuts()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownShortcut(id.to_string()))
    }
}

/// Generic key-value settings
pub trait SettingsStore: Send + Sync {
    /// Read a setting, falling back to `default` when it was never set
    fn get_setting(&self, key: &str, default: Value) -> Result<Value>;
    fn set_setting(&self, key: &str, value: Value) -> Result<()>;
}

/// Both halves of the persistence collaborator
pub trait Store: ShortcutStore + SettingsStore {}

impl<T: ShortcutStore + SettingsStore> Store for T {}

/// On-disk and in-memory layout of the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    shortcuts: ShortcutsDictionary,
    settings: BTreeMap<String, Value>,
}

impl StoreData {
    fn add(&mut self, shortcut: Shortcut) -> Result<()> {
        if shortcut.cmd.trim().is_empty() || shortcut.name.trim().is_empty() {
            return Err(Error::Store("Shortcut name and command are required".to_string()));
        }
        if self.shortcuts.contains(&shortcut.id) {
            return Err(Error::Store(format!("Shortcut {} already exists", shortcut.id)));
        }
        self.check_position(&shortcut)?;
        self.shortcuts.insert(shortcut);
        Ok(())
    }

    fn modify(&mut self, shortcut: Shortcut) -> Result<()> {
        if !self.shortcuts.contains(&shortcut.id) {
            return Err(Error::UnknownShortcut(shortcut.id));
        }
        self.check_position(&shortcut)?;
        self.shortcuts.insert(shortcut);
        Ok(())
    }

    fn replace(&mut self, shortcuts: ShortcutsDictionary) -> Result<()> {
        if let Some(position) = shortcuts.duplicate_position() {
            return Err(Error::Store(format!(
                "More than one shortcut at position {position}"
            )));
        }
        self.shortcuts = shortcuts;
        Ok(())
    }

    /// Positions are unique among stored shortcuts
    fn check_position(&self, shortcut: &Shortcut) -> Result<()> {
        match self
            .shortcuts
            .iter()
            .find(|other| other.id != shortcut.id && other.position == shortcut.position)
        {
            Some(other) => Err(Error::Store(format!(
                "Position {} is already used by {}",
                shortcut.position, other.id
            ))),
            None => Ok(()),
        }
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        self.shortcuts
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownShortcut(id.to_string()))
    }

    fn setting(&self, key: &str, default: Value) -> Value {
        self.settings.get(key).cloned().unwrap_or(default)
    }
}

/// Store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with shortcuts
    pub fn with_shortcuts(shortcuts: ShortcutsDictionary) -> Self {
        Self {
            data: Mutex::new(StoreData {
                shortcuts,
                settings: BTreeMap::new(),
            }),
        }
    }
}

impl ShortcutStore for MemoryStore {
    fn get_shortcuts(&self) -> Result<ShortcutsDictionary> {
        Ok(self.data.lock().shortcuts.clone())
    }

    fn set_shortcuts(&self, shortcuts: ShortcutsDictionary) -> Result<ShortcutsDictionary> {
        let mut data = self.data.lock();
        data.replace(shortcuts)?;
        Ok(data.shortcuts.clone())
    }

    fn add_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        let mut data = self.data.lock();
        data.add(shortcut)?;
        Ok(data.shortcuts.clone())
    }

    fn mod_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        let mut data = self.data.lock();
        data.modify(shortcut)?;
        Ok(data.shortcuts.clone())
    }

    fn remove_shortcut(&self, id: &str) -> Result<ShortcutsDictionary> {
        let mut data = self.data.lock();
        data.remove(id)?;
        Ok(data.shortcuts.clone())
    }
}

impl SettingsStore for MemoryStore {
    fn get_setting(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.data.lock().setting(key, default))
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        self.data.lock().settings.insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON file store. Every mutation is written through before it returns.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Store(format!("Failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Store(format!("Corrupt store {}: {e}", path.display())))?
        } else {
            debug!("Store {} does not exist yet", path.display());
            StoreData::default()
        };
        info!(
            "Opened store {} ({} shortcuts)",
            path.display(),
            data.shortcuts.len()
        );
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to the data and persist the result; on failure nothing changes
    fn update<F>(&self, f: F) -> Result<StoreData>
    where
        F: FnOnce(&mut StoreData) -> Result<()>,
    {
        let mut data = self.data.lock();
        let mut next = data.clone();
        f(&mut next)?;
        write_atomic(&self.path, &next)?;
        *data = next;
        Ok(data.clone())
    }
}

fn write_atomic(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("Failed to create {}: {e}", parent.display())))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(data)?;
    std::fs::write(&tmp, json)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| Error::Store(format!("Failed to write {}: {e}", path.display())))
}

impl ShortcutStore for FileStore {
    fn get_shortcuts(&self) -> Result<ShortcutsDictionary> {
        Ok(self.data.lock().shortcuts.clone())
    }

    fn set_shortcuts(&self, shortcuts: ShortcutsDictionary) -> Result<ShortcutsDictionary> {
        self.update(|data| data.replace(shortcuts))
            .map(|data| data.shortcuts)
    }

    fn add_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        self.update(|data| data.add(shortcut))
            .map(|data| data.shortcuts)
    }

    fn mod_shortcut(&self, shortcut: Shortcut) -> Result<ShortcutsDictionary> {
        self.update(|data| data.modify(shortcut))
            .map(|data| data.shortcuts)
    }

    fn remove_shortcut(&self, id: &str) -> Result<ShortcutsDictionary> {
        self.update(|data| data.remove(id)).map(|data| data.shortcuts)
    }
}

impl SettingsStore for FileStore {
    fn get_setting(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.data.lock().setting(key, default))
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        self.update(|data| {
            data.settings.insert(key.to_string(), value);
            Ok(())
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backup() -> Shortcut {
        Shortcut::script("Backup", "tar czf /tmp/b.tgz /home").with_id("s1")
    }

    #[test]
    fn test_add_then_get_round_trip() {
        let store = MemoryStore::new();
        let original = backup().with_hooks(["mount"]).with_position(4);
        store.add_shortcut(original.clone()).unwrap();

        let fetched = store.get_shortcuts().unwrap();
        assert_eq!(fetched.get("s1"), Some(&original));
        assert_eq!(store.get_shortcut("s1").unwrap().id, "s1");
    }

    #[test]
    fn test_reads_are_copies() {
        let store = MemoryStore::new();
        store.add_shortcut(backup()).unwrap();

        let mut copy = store.get_shortcuts().unwrap();
        copy.remove("s1");
        assert!(store.get_shortcuts().unwrap().contains("s1"));
    }

    #[test]
    fn test_add_rejects_duplicates_and_blank_commands() {
        let store = MemoryStore::new();
        store.add_shortcut(backup()).unwrap();
        assert!(matches!(store.add_shortcut(backup()), Err(Error::Store(_))));
        assert!(matches!(
            store.add_shortcut(Shortcut::script("x", "  ")),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn test_mod_and_remove() {
        let store = MemoryStore::new();
        store.add_shortcut(backup()).unwrap();

        let mut updated = backup();
        updated.name = "Nightly backup".to_string();
        let dict = store.mod_shortcut(updated).unwrap();
        assert_eq!(dict.get("s1").unwrap().name, "Nightly backup");

        let dict = store.remove_shortcut("s1").unwrap();
        assert!(dict.is_empty());
        assert!(matches!(
            store.remove_shortcut("s1"),
            Err(Error::UnknownShortcut(id)) if id == "s1"
        ));
        assert!(matches!(
            store.mod_shortcut(backup()),
            Err(Error::UnknownShortcut(_))
        ));
    }

    #[test]
    fn test_positions_must_be_unique() {
        let store = MemoryStore::new();
        store.add_shortcut(backup().with_position(1)).unwrap();
        let other = Shortcut::script("Sync", "rsync -a ~ /mnt").with_id("s2");

        assert!(matches!(
            store.add_shortcut(other.clone().with_position(1)),
            Err(Error::Store(_))
        ));
        store.add_shortcut(other.clone().with_position(2)).unwrap();
        assert!(matches!(
            store.mod_shortcut(other.clone().with_position(1)),
            Err(Error::Store(_))
        ));
        // Keeping its own position is not a conflict
        store.mod_shortcut(other.clone().with_position(2)).unwrap();

        let clash: ShortcutsDictionary = [backup().with_position(3), other.with_position(3)]
            .into_iter()
            .collect();
        assert!(matches!(store.set_shortcuts(clash), Err(Error::Store(_))));
        assert_eq!(store.get_shortcut("s2").unwrap().position, 2);
    }

    #[test]
    fn test_file_store_rejects_duplicate_positions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("s.json")).unwrap();
        store.add_shortcut(backup().with_position(1)).unwrap();
        let clash = Shortcut::script("Sync", "rsync -a ~ /mnt").with_position(1);
        assert!(matches!(store.add_shortcut(clash), Err(Error::Store(_))));

        let reopened = FileStore::open(store.path()).unwrap();
        assert_eq!(reopened.get_shortcuts().unwrap().len(), 1);
    }

    #[test]
    fn test_settings_default() {
        let store = MemoryStore::new();
        assert_eq!(store.get_setting("theme", json!("dark")).unwrap(), json!("dark"));
        store.set_setting("theme", json!("light")).unwrap();
        assert_eq!(store.get_setting("theme", json!("dark")).unwrap(), json!("light"));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shortcuts.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.add_shortcut(backup()).unwrap();
            store.set_setting("runningPids", json!({"s1": 12})).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_shortcut("s1").unwrap(), backup());
        assert_eq!(
            store.get_setting("runningPids", json!({})).unwrap(),
            json!({"s1": 12})
        );
    }

    #[test]
    fn test_file_store_failed_update_leaves_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("s.json")).unwrap();
        assert!(store.remove_shortcut("missing").is_err());
        assert!(store.get_shortcuts().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(Error::Store(_))));
    }
}
