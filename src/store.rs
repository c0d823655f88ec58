//! Persistent KV store (C8): a single JSON file holding last-seen hook
//! state across poll ticks. Opened, mutated, and rewritten atomically
//! (temp file + rename) each tick; `0600` permissions are enforced on
//! every write, matching the Design Notes' preference for a flat file
//! over an embedded database for "tens of hook states at most."

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored value, tagged so non-JSON-native types (timestamps) round-trip
/// exactly rather than degrading to strings with ambiguous meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum TaggedValue {
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl From<Value> for TaggedValue {
    fn from(v: Value) -> Self {
        TaggedValue::Json(v)
    }
}

impl From<DateTime<Utc>> for TaggedValue {
    fn from(v: DateTime<Utc>) -> Self {
        TaggedValue::Timestamp(v)
    }
}

pub struct Store {
    path: PathBuf,
    entries: BTreeMap<String, TaggedValue>,
}

impl Store {
    /// Opens `path`, reading its current contents if it exists. A missing
    /// file is treated as an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, key: &str) -> Option<&TaggedValue> {
        self.entries.get(key)
    }

    /// Sets `key` and immediately persists the whole store.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<TaggedValue>) -> std::io::Result<()> {
        self.entries.insert(key.into(), value.into());
        self.flush()
    }

    pub fn delete(&mut self, key: &str) -> std::io::Result<()> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("store"),
            std::process::id()
        ));

        {
            let mut tmp = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            let serialized = serde_json::to_vec_pretty(&self.entries)?;
            tmp.write_all(&serialized)?;
            tmp.sync_all()?;
        }

        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_opens_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.json")).unwrap();
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn set_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = Store::open(&path).unwrap();
        store.set("hook|Resources.X.Metadata", Value::String("v1".to_string())).unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(
            reopened.get("hook|Resources.X.Metadata"),
            Some(&TaggedValue::Json(Value::String("v1".to_string())))
        );
    }

    #[test]
    fn file_permissions_are_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = Store::open(&path).unwrap();
        store.set("k", Value::Bool(true)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn delete_removes_key_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = Store::open(&path).unwrap();
        store.set("k", Value::Bool(true)).unwrap();
        store.delete("k").unwrap();

        let reopened = Store::open(&path).unwrap();
        assert!(reopened.get("k").is_none());
    }

    #[test]
    fn timestamp_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = Store::open(&path).unwrap();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        store.set("lastUpdated", now).unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get("lastUpdated"), Some(&TaggedValue::Timestamp(now)));
    }
}
