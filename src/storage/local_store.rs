//! Small JSON file-backed key-value store for session-spanning state:
//! the persisted directory reference, the shared last-save entry, and
//! autosave config/statistics. The analog of the host's structured local
//! storage, scoped to an application data path.

use crate::core::{Result, StorageError};
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Key layout shared by the storage service and the autosave coordinator.
pub mod keys {
    pub fn directory(service: &str) -> String {
        format!("{service}-directory")
    }

    pub fn last_save(service: &str) -> String {
        format!("{service}-last-save")
    }

    pub fn autosave_config(directory_key: &str) -> String {
        format!("autosave-config-{directory_key}")
    }

    pub fn autosave_stats(directory_key: &str) -> String {
        format!("autosave-stats-{directory_key}")
    }
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl LocalStore {
    /// Open the store backing file, tolerating absence and corruption: a
    /// store that cannot be read starts empty rather than failing startup.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(
                        "Local store '{}' is corrupt, starting empty: {err}",
                        path.display()
                    );
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self {
            inner: Arc::new(Inner {
                path,
                entries: Mutex::new(entries),
            }),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        let value = entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!("Local store entry '{key}' failed to decode: {err}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)?;
        {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(key.to_string(), encoded);
        }
        self.persist()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(key).is_some()
        };
        if removed { self.persist() } else { Ok(()) }
    }

    fn persist(&self) -> Result<()> {
        let serialized = {
            let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*entries)?
        };
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StorageError::from_io("Creating local store directory", &err))?;
        }
        let tmp_path = self.inner.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)
            .map_err(|err| StorageError::from_io("Writing local store", &err))?;
        fs::rename(&tmp_path, &self.inner.path)
            .map_err(|err| StorageError::from_io("Committing local store", &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn set_get_remove_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path().join("state.json"));

        store.set("alpha", &json!({"n": 1})).unwrap();
        assert_eq!(store.get::<Value>("alpha").unwrap()["n"], 1);

        store.remove("alpha").unwrap();
        assert!(store.get::<Value>("alpha").is_none());
    }

    #[test]
    fn entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");

        LocalStore::open(&path).set("kept", &"value").unwrap();

        let reopened = LocalStore::open(&path);
        assert_eq!(reopened.get::<String>("kept").unwrap(), "value");
    }

    #[test]
    fn corrupt_backing_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let store = LocalStore::open(&path);
        assert!(store.get::<Value>("anything").is_none());
        store.set("fresh", &1).unwrap();
        assert_eq!(store.get::<i64>("fresh").unwrap(), 1);
    }

    #[test]
    fn key_layout() {
        assert_eq!(keys::last_save("case-storage"), "case-storage-last-save");
        assert_eq!(keys::autosave_config("d1"), "autosave-config-d1");
        assert_eq!(keys::autosave_stats("d1"), "autosave-stats-d1");
    }
}
