use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::db::write_atomic;

pub const LAST_WEEKLY_BACKUP_KEY: &str = "lastWeeklyBackupTimestamp";

#[derive(Error, Debug)]
pub enum KvStoreError {
    #[error("settings file is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("settings file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file write failed: {0}")]
    Write(String),
}

/// Persisted string key/value storage owned by the host application.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn save(&self) -> Result<(), KvStoreError>;
}

/// JSON object on disk, loaded once and rewritten atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KvStoreError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.data.lock().ok()?;
        match guard.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    fn save(&self) -> Result<(), KvStoreError> {
        let payload = {
            let guard = self
                .data
                .lock()
                .map_err(|_| KvStoreError::Write("settings lock poisoned".into()))?;
            serde_json::to_vec_pretty(&*guard)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &payload).map_err(|err| KvStoreError::Write(err.to_string()))
    }
}

#[derive(Default)]
struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn save(&self) -> Result<(), KvStoreError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn KeyValueStore>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { inner: store }
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Result<Self, KvStoreError> {
        Ok(Self::new(Arc::new(JsonFileStore::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// Epoch millis of the last weekly backup. Unparsable values read as unset.
    pub fn last_weekly_backup(&self) -> Option<i64> {
        let raw = self.inner.get(LAST_WEEKLY_BACKUP_KEY)?;
        match raw.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target: "headlog",
                    event = "weekly_timestamp_unparsable",
                    value = %raw,
                    error = %err
                );
                None
            }
        }
    }

    pub fn set_last_weekly_backup(&self, timestamp_ms: i64) -> Result<(), KvStoreError> {
        self.inner
            .set(LAST_WEEKLY_BACKUP_KEY, &timestamp_ms.to_string());
        self.inner.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_roundtrips_weekly_timestamp() {
        let store = StoreHandle::in_memory();
        assert_eq!(store.last_weekly_backup(), None);
        store.set_last_weekly_backup(1_700_000_000_000).unwrap();
        assert_eq!(store.last_weekly_backup(), Some(1_700_000_000_000));
    }

    #[test]
    fn json_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = StoreHandle::json_file(&path).unwrap();
        store.set_last_weekly_backup(42).unwrap();

        let reopened = StoreHandle::json_file(&path).unwrap();
        assert_eq!(reopened.last_weekly_backup(), Some(42));
    }

    #[test]
    fn garbage_timestamp_reads_as_unset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, br#"{"lastWeeklyBackupTimestamp":"soon"}"#).unwrap();

        let store = StoreHandle::json_file(&path).unwrap();
        assert_eq!(store.last_weekly_backup(), None);
    }

    #[test]
    fn corrupt_settings_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(KvStoreError::Corrupt(_))
        ));
    }
}
