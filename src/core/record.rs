//! Persisted ordering of the machine list.
//!
//! The list lives under the `"VMList"` key of a JSON preferences file shared with other settings,
//! so writes preserve every other key.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::drives::discard_partial;
use crate::error::{Error, Result};

pub const LIST_KEY: &str = "VMList";

/// One persisted list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub shortcut: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Entry(EntryRecord),
    /// Older lists stored bare bundle names relative to the storage root.
    Legacy(String),
}

/// Records as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedRecord {
    Entry(EntryRecord),
    Legacy(String),
}

#[derive(Debug, Clone)]
pub struct ListStore {
    path: PathBuf,
}

impl ListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => return Err(Error::io("read", &self.path, source)),
        };
        if contents.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::ListRecord {
                path: self.path.clone(),
                message: "preferences must be a JSON object".to_string(),
            }),
            Err(err) => Err(Error::ListRecord {
                path: self.path.clone(),
                message: err.to_string(),
            }),
        }
    }

    /// Read the stored list. Missing files yield an empty list; malformed entries are skipped.
    pub fn load(&self) -> Result<Vec<LoadedRecord>> {
        let document = self.read_document()?;
        let Some(value) = document.get(LIST_KEY) else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(Error::ListRecord {
                path: self.path.clone(),
                message: format!("`{LIST_KEY}` must be an array"),
            });
        };
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match StoredRecord::deserialize(item) {
                Ok(StoredRecord::Entry(record)) => records.push(LoadedRecord::Entry(record)),
                Ok(StoredRecord::Legacy(path)) => records.push(LoadedRecord::Legacy(path)),
                Err(err) => log::warn!("skipping unreadable list entry {item}: {err}"),
            }
        }
        Ok(records)
    }

    /// Replace the stored list, keeping every other key in the preferences file.
    pub fn store(&self, records: &[EntryRecord]) -> Result<()> {
        let mut document = match self.read_document() {
            Ok(document) => document,
            Err(err) => {
                log::warn!("rewriting unreadable preferences: {err}");
                Map::new()
            }
        };
        let list = serde_json::to_value(records).map_err(|err| Error::ListRecord {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        document.insert(LIST_KEY.to_string(), list);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::io("create", parent, source))?;
        }
        let serialized =
            serde_json::to_string_pretty(&Value::Object(document)).map_err(|err| {
                Error::ListRecord {
                    path: self.path.clone(),
                    message: err.to_string(),
                }
            })?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serialized).map_err(|source| Error::io("write", &staging, source))?;
        fs::rename(&staging, &self.path).map_err(|source| {
            discard_partial(&staging);
            Error::io("replace", &self.path, source)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_an_empty_list() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path().join("prefs.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn store_preserves_unrelated_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, r#"{"Theme": "dark", "VMList": []}"#).unwrap();
        let store = ListStore::new(&path);

        store
            .store(&[EntryRecord {
                path: "/vms/A.vmbundle".into(),
                name: Some("A".into()),
                shortcut: false,
            }])
            .unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["Theme"], "dark");
        assert_eq!(value[LIST_KEY][0]["name"], "A");
    }

    #[test]
    fn legacy_and_current_records_load_side_by_side() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(
            &path,
            r#"{"VMList": ["Old.vmbundle", {"path": "/x/New.vmbundle", "shortcut": true}, 7]}"#,
        )
        .unwrap();

        let records = ListStore::new(&path).load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], LoadedRecord::Legacy("Old.vmbundle".into()));
        assert!(matches!(&records[1], LoadedRecord::Entry(entry) if entry.shortcut && entry.name.is_none()));
    }

    #[test]
    fn non_object_preferences_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "[1, 2]").unwrap();
        let err = ListStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::ListRecord { .. }));
    }
}
