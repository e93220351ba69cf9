//! Key/value notes shared across sessions and loop runs.
//!
//! A [`SharedContextStore`] is a JSON object on disk. It is constructed
//! explicitly by the caller and passed to whatever needs it.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SharedContextStore {
    path: PathBuf,
    values: Map<String, Value>,
}

impl SharedContextStore {
    /// Empty store that will be written to `path` on [`save`](Self::save).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: Map::new(),
        }
    }

    /// Load from `path`. A missing file gives an empty store; an unreadable or
    /// malformed one is logged and also gives an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<Map<String, Value>>(&json) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring malformed shared context at {}: {e}", path.display());
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!("Ignoring unreadable shared context at {}: {e}", path.display());
                Map::new()
            }
        };
        debug!("Loaded {} shared context key(s)", values.len());
        Self { path, values }
    }

    /// Atomic write: temp file, then rename.
    pub fn save(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create shared context dir: {e}"))?;
        }
        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| format!("Failed to serialize shared context: {e}"))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| format!("Failed to write shared context: {e}"))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| format!("Failed to rename shared context: {e}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `key: value` lines, strings unquoted.
    pub fn render(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/shared.json");

        let mut store = SharedContextStore::load(&path);
        assert!(store.is_empty());
        store.set("goal", "ship parser");
        store.set("loops_run", 3);
        store.save().unwrap();

        let mut reloaded = SharedContextStore::load(&path);
        assert_eq!(reloaded.get_str("goal"), Some("ship parser"));
        assert_eq!(reloaded.get("loops_run"), Some(&Value::from(3)));
        assert_eq!(reloaded.remove("goal"), Some(Value::from("ship parser")));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(SharedContextStore::load(&path).is_empty());
    }

    #[test]
    fn render_lines() {
        let mut store = SharedContextStore::new("unused.json");
        store.set("a", "text");
        store.set("b", true);
        assert_eq!(store.render(), vec!["a: text", "b: true"]);
    }
}
