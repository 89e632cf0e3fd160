/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Key/value persistence for all durable client state.
//!
//! Everything the client remembers between runs lives here as a flat
//! JSON-serializable map: the publishers list, per-publisher and
//! per-subscription records, cached resources, pending command queues,
//! downloaded settings, and the anonymous app id. Backends are swappable;
//! the crate ships a single-file JSON store and an in-memory store for
//! tests and headless embedding.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait PreferenceBackend: Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn remove(&mut self, key: &str);
    /// A copy of the whole store, for diagnostics payloads.
    fn snapshot(&self) -> Map<String, Value>;
}

/// Volatile store, used in tests and short-lived headless runs.
#[derive(Default)]
pub struct MemoryBackend {
    values: Map<String, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceBackend for MemoryBackend {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }
}

/// Durable store backed by a single JSON object file. Every mutation is
/// written back via a temp-file-and-rename so a crash mid-write cannot
/// truncate existing state.
pub struct JsonFileBackend {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e),
        };
        Ok(JsonFileBackend { path, values })
    }

    fn persist(&self) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, serde_json::to_string(&self.values)?)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = write() {
            log::warn!("could not persist preferences to {:?}: {}", self.path, e);
        }
    }
}

impl PreferenceBackend for JsonFileBackend {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
        self.persist();
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.persist();
        }
    }

    fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }
}

type Observer = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// Cheap-to-clone shared handle over a [`PreferenceBackend`], with typed
/// accessors. An optional observer is notified after every write, outside
/// the store lock.
#[derive(Clone)]
pub struct Preferences {
    backend: Arc<Mutex<Box<dyn PreferenceBackend>>>,
    observer: Arc<Mutex<Option<Observer>>>,
}

impl Preferences {
    pub fn new(backend: Box<dyn PreferenceBackend>) -> Self {
        Preferences {
            backend: Arc::new(Mutex::new(backend)),
            observer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    pub(crate) fn set_observer(&self, observer: Observer) {
        *self.observer.lock() = Some(observer);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.backend.lock().get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn get_object(&self, key: &str) -> Map<String, Value> {
        self.get(key)
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.backend.lock().set(key, value.clone());
        if let Some(observer) = &*self.observer.lock() {
            observer(key, &value);
        }
    }

    pub fn remove(&self, key: &str) {
        self.backend.lock().remove(key);
        if let Some(observer) = &*self.observer.lock() {
            observer(key, &Value::Null);
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.backend.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_round_trip() {
        let prefs = Preferences::in_memory();
        assert!(prefs.get("publishers").is_none());
        prefs.set("publishers", json!(["https://fonts.example.com/api/"]));
        assert_eq!(
            prefs.get_string_list("publishers"),
            vec!["https://fonts.example.com/api/".to_string()]
        );
        prefs.remove("publishers");
        assert!(prefs.get("publishers").is_none());
    }

    #[test]
    fn test_json_file_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        {
            let prefs = Preferences::new(Box::new(JsonFileBackend::new(&path).unwrap()));
            prefs.set("anonymousAppID", json!("0001-0002"));
            prefs.set("userAccountStatus", json!("pro"));
        }
        let prefs = Preferences::new(Box::new(JsonFileBackend::new(&path).unwrap()));
        assert_eq!(prefs.get_string("anonymousAppID").unwrap(), "0001-0002");
        assert_eq!(prefs.get_string("userAccountStatus").unwrap(), "pro");
    }

    #[test]
    fn test_json_file_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("absent.json")).unwrap();
        assert!(backend.get("anything").is_none());
    }

    #[test]
    fn test_observer_fires_after_write() {
        let prefs = Preferences::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        prefs.set_observer(Box::new(move |key, _| seen2.lock().push(key.to_string())));
        prefs.set("downloadedSettings", json!({}));
        prefs.remove("downloadedSettings");
        assert_eq!(
            *seen.lock(),
            vec!["downloadedSettings".to_string(), "downloadedSettings".to_string()]
        );
    }
}
