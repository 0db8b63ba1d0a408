use crate::process::ProcessHandle;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Bookkeeping for one in-flight execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateEntry {
    pub shortcut_id: String,
    pub process_handle: ProcessHandle,
    pub started_at: DateTime<Utc>,
    /// Distinguishes successive runs of the same shortcut
    pub run: u64,
    /// Taken over from a previous engine instance rather than spawned by this one
    #[serde(default)]
    pub adopted: bool,
}

/// Which shortcuts are running right now, and with which process.
///
/// An id is present only between a successful start and the first observed
/// exit or kill. Readers share the lock; writers hold it only for the map
/// operation itself. All reads hand out copies.
#[derive(Debug, Default)]
pub struct RunStateTable {
    entries: RwLock<HashMap<String, RunStateEntry>>,
}

impl RunStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a running shortcut, returning any entry it displaced
    pub fn set(&self, id: &str, entry: RunStateEntry) -> Option<RunStateEntry> {
        self.entries.write().insert(id.to_string(), entry)
    }

    /// Remove an entry. Clearing an absent id is a no-op.
    pub fn clear(&self, id: &str) -> Option<RunStateEntry> {
        self.entries.write().remove(id)
    }

    /// Remove the entry only if it still belongs to `run`.
    ///
    /// Exit watchers and kills race on this; exactly one of them gets `Some`.
    pub fn take_run(&self, id: &str, run: u64) -> Option<RunStateEntry> {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(entry) if entry.run == run => entries.remove(id),
            _ => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<RunStateEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Ids of all running shortcuts
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copies of all entries
    pub fn entries(&self) -> Vec<RunStateEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(id: &str, run: u64) -> RunStateEntry {
        RunStateEntry {
            shortcut_id: id.to_string(),
            process_handle: ProcessHandle::from_pid(1000 + run as u32),
            started_at: Utc::now(),
            run,
            adopted: false,
        }
    }

    #[test]
    fn test_set_get_clear() {
        let table = RunStateTable::new();
        assert!(table.is_empty());

        table.set("s1", entry("s1", 1));
        assert!(table.contains("s1"));
        assert_eq!(table.get("s1").unwrap().run, 1);
        assert_eq!(table.snapshot().into_iter().collect::<Vec<_>>(), vec!["s1"]);

        assert!(table.clear("s1").is_some());
        assert!(table.clear("s1").is_none());
        assert!(table.get("s1").is_none());
    }

    #[test]
    fn test_take_run_ignores_newer_runs() {
        let table = RunStateTable::new();
        table.set("s1", entry("s1", 2));

        assert!(table.take_run("s1", 1).is_none());
        assert!(table.contains("s1"));
        assert_eq!(table.take_run("s1", 2).unwrap().run, 2);
        assert!(table.take_run("s1", 2).is_none());
    }

    #[test]
    fn test_concurrent_take_run_has_one_winner() {
        let table = Arc::new(RunStateTable::new());
        table.set("s1", entry("s1", 7));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.take_run("s1", 7).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(table.is_empty());
    }
}
