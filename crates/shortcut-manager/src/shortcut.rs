//! Shortcut records and the id-keyed dictionary that holds them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// A user-defined named command, either an application launch or a background script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortcut {
    /// Stable unique identifier, generated once at creation
    pub id: String,
    /// Display name
    pub name: String,
    /// Shell command line
    pub cmd: String,
    /// Display and execution order
    pub position: i64,
    /// Whether completion is reported by the host's app lifecycle instead of process exit
    pub is_app: bool,
    /// Hook identifiers, applied in this order
    #[serde(default)]
    pub hooks: Vec<String>,
}

impl Shortcut {
    /// Create a new shortcut with a freshly generated id
    pub fn new(
        name: impl Into<String>,
        cmd: impl Into<String>,
        position: i64,
        is_app: bool,
        hooks: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cmd: cmd.into(),
            position,
            is_app,
            hooks,
        }
    }

    /// Create a background script shortcut with no hooks
    pub fn script(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self::new(name, cmd, 0, false, Vec::new())
    }

    /// Replace the id, keeping every other field
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the position
    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    /// Set the hook identifiers
    pub fn with_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this shortcut as an application entry
    pub fn app(mut self) -> Self {
        self.is_app = true;
        self
    }
}

/// Mapping from shortcut id to shortcut.
///
/// Every key equals the `id` of its value; this holds for inserts and is
/// checked when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ShortcutsDictionary {
    entries: BTreeMap<String, Shortcut>,
}

impl<'de> Deserialize<'de> for ShortcutsDictionary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = BTreeMap::<String, Shortcut>::deserialize(deserializer)?;
        for (key, shortcut) in &entries {
            if key != &shortcut.id {
                return Err(serde::de::Error::custom(format!(
                    "Shortcut key '{key}' does not match its id '{}'",
                    shortcut.id
                )));
            }
        }
        Ok(Self { entries })
    }
}

impl ShortcutsDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a shortcut under its own id, returning the record it replaced
    pub fn insert(&mut self, shortcut: Shortcut) -> Option<Shortcut> {
        self.entries.insert(shortcut.id.clone(), shortcut)
    }

    /// Remove a shortcut by id
    pub fn remove(&mut self, id: &str) -> Option<Shortcut> {
        self.entries.remove(id)
    }

    /// Look up a shortcut by id
    pub fn get(&self, id: &str) -> Option<&Shortcut> {
        self.entries.get(id)
    }

    /// Check whether an id is present
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of shortcuts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shortcuts ordered by position, ties broken by id
    pub fn ordered(&self) -> Vec<&Shortcut> {
        let mut list: Vec<&Shortcut> = self.entries.values().collect();
        list.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// The position one past the current maximum
    pub fn next_position(&self) -> i64 {
        self.entries
            .values()
            .map(|s| s.position)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// A position held by more than one shortcut, if any
    pub fn duplicate_position(&self) -> Option<i64> {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .map(|s| s.position)
            .find(|position| !seen.insert(*position))
    }

    /// Move a shortcut to `index` in display order and renumber positions from 1.
    ///
    /// Returns false if the id is unknown.
    pub fn move_to(&mut self, id: &str, index: usize) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut ids: Vec<String> = self
            .ordered()
            .into_iter()
            .map(|s| s.id.clone())
            .filter(|other| other != id)
            .collect();
        ids.insert(index.min(ids.len()), id.to_string());

        for (pos, id) in ids.iter().enumerate() {
            if let Some(shortcut) = self.entries.get_mut(id) {
                shortcut.position = pos as i64 + 1;
            }
        }
        true
    }

    /// Iterate over shortcuts in id order
    pub fn iter(&self) -> impl Iterator<Item = &Shortcut> + '_ {
        self.entries.values()
    }
}

impl FromIterator<Shortcut> for ShortcutsDictionary {
    fn from_iter<T: IntoIterator<Item = Shortcut>>(iter: T) -> Self {
        let mut dict = Self::new();
        for shortcut in iter {
            dict.insert(shortcut);
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shortcut_ids_are_unique() {
        let a = Shortcut::script("a", "true");
        let b = Shortcut::script("a", "true");
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_serialized_field_names() {
        let shortcut = Shortcut::script("Backup", "tar czf /tmp/b.tgz /home").with_id("s1");
        let value = serde_json::to_value(&shortcut).unwrap();
        assert_eq!(value["id"], "s1");
        assert_eq!(value["isApp"], false);
        assert_eq!(value["hooks"], serde_json::json!([]));
    }

    #[test]
    fn test_ordered_by_position() {
        let dict: ShortcutsDictionary = [
            Shortcut::script("c", "true").with_id("c").with_position(30),
            Shortcut::script("a", "true").with_id("a").with_position(10),
            Shortcut::script("b", "true").with_id("b").with_position(20),
        ]
        .into_iter()
        .collect();

        let names: Vec<&str> = dict.ordered().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(dict.next_position(), 31);
        assert_eq!(dict.duplicate_position(), None);
    }

    #[test]
    fn test_next_position_saturates() {
        let dict: ShortcutsDictionary = [Shortcut::script("a", "true").with_position(i64::MAX)]
            .into_iter()
            .collect();
        assert_eq!(dict.next_position(), i64::MAX);
        assert_eq!(ShortcutsDictionary::new().next_position(), 1);
    }

    #[test]
    fn test_duplicate_position() {
        let dict: ShortcutsDictionary = [
            Shortcut::script("a", "true").with_id("a").with_position(1),
            Shortcut::script("b", "true").with_id("b").with_position(2),
            Shortcut::script("c", "true").with_id("c").with_position(2),
        ]
        .into_iter()
        .collect();
        assert_eq!(dict.duplicate_position(), Some(2));
    }

    #[test]
    fn test_move_to_renumbers() {
        let mut dict: ShortcutsDictionary = [
            Shortcut::script("a", "true").with_id("a").with_position(1),
            Shortcut::script("b", "true").with_id("b").with_position(5),
            Shortcut::script("c", "true").with_id("c").with_position(9),
        ]
        .into_iter()
        .collect();

        assert!(dict.move_to("c", 0));
        let order: Vec<(&str, i64)> = dict
            .ordered()
            .iter()
            .map(|s| (s.id.as_str(), s.position))
            .collect();
        assert_eq!(order, vec![("c", 1), ("a", 2), ("b", 3)]);

        assert!(!dict.move_to("missing", 0));
    }

    #[test]
    fn test_deserialize_rejects_mismatched_key() {
        let json = r#"{"x": {"id": "y", "name": "n", "cmd": "true", "position": 1, "isApp": false}}"#;
        let result: Result<ShortcutsDictionary, _> = serde_json::from_str(json);
        assert!(result.is_err());

        let json = r#"{"y": {"id": "y", "name": "n", "cmd": "true", "position": 1, "isApp": false}}"#;
        let dict: ShortcutsDictionary = serde_json::from_str(json).unwrap();
        assert!(dict.get("y").unwrap().hooks.is_empty());
    }
}
