//! Time-bounded key/value storage.
//!
//! The options layer of the host CMS is an external collaborator; this
//! module models only the slice of it the purge services need: JSON
//! values that expire after a TTL. `update` runs read-merge-write under an
//! exclusive lock so concurrent purges cannot drop each other's writes.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lxcache_core::io::{Lookup, read_record, remove_record, with_exclusive_lock, write_record};
use lxcache_core::{RecordLayout, unix_now};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::error::InfraError;

pub type TransientUpdate<'a> = &'a mut dyn FnMut(Option<Value>) -> Option<Value>;

pub trait TransientStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, InfraError>;

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), InfraError>;

    fn delete(&self, key: &str) -> Result<(), InfraError>;

    /// Atomically replace the value with `f(current)`. Returning `None`
    /// deletes the transient.
    fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: TransientUpdate<'_>,
    ) -> Result<Option<Value>, InfraError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTransient {
    expires_at: u64,
    value: Value,
}

impl StoredTransient {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            expires_at: u64::from(unix_now()).saturating_add(ttl.as_secs()),
            value,
        }
    }

    fn live(self) -> Option<Value> {
        (u64::from(unix_now()) <= self.expires_at).then_some(self.value)
    }
}

/// One JSON file per transient under a state directory.
#[derive(Debug, Clone)]
pub struct FileTransientStore {
    dir: PathBuf,
}

impl FileTransientStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Option<Value>, InfraError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let stored: StoredTransient =
            serde_json::from_slice(bytes).map_err(|source| InfraError::Transient {
                key: key.to_string(),
                source,
            })?;
        Ok(stored.live())
    }

    fn encode(key: &str, value: Value, ttl: Duration) -> Result<Vec<u8>, InfraError> {
        serde_json::to_vec(&StoredTransient::new(value, ttl)).map_err(|source| {
            InfraError::Transient {
                key: key.to_string(),
                source,
            }
        })
    }
}

impl TransientStore for FileTransientStore {
    fn get(&self, key: &str) -> Result<Option<Value>, InfraError> {
        let path = self.path_for(key);
        match read_record(&path, RecordLayout::Persistent, 0)
            .map_err(|err| InfraError::path(&path, err))?
        {
            Lookup::Fresh(record) => Self::decode(key, &record.payload),
            _ => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), InfraError> {
        let path = self.path_for(key);
        let bytes = Self::encode(key, value, ttl)?;
        write_record(&path, None, &bytes).map_err(|err| InfraError::path(&path, err))
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        let path = self.path_for(key);
        remove_record(&path)
            .map(|_| ())
            .map_err(|err| InfraError::path(&path, err))
    }

    fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: TransientUpdate<'_>,
    ) -> Result<Option<Value>, InfraError> {
        let path = self.path_for(key);
        let mut outcome: Result<Option<Value>, InfraError> = Ok(None);
        with_exclusive_lock(&path, |file| {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            // A corrupt transient is discarded rather than blocking every
            // later update.
            let current = Self::decode(key, &bytes).unwrap_or(None);
            let next = f(current);

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            if let Some(value) = next.clone() {
                match Self::encode(key, value, ttl) {
                    Ok(encoded) => file.write_all(&encoded)?,
                    Err(err) => {
                        outcome = Err(err);
                        return Ok(());
                    }
                }
            }
            file.flush()?;
            outcome = Ok(next);
            Ok(())
        })
        .map_err(|err| InfraError::path(&path, err))?;
        outcome
    }
}

/// Process-local store used by tests and single-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryTransientStore {
    entries: Mutex<HashMap<String, StoredTransient>>,
}

impl MemoryTransientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovers the map if a previous holder panicked.
    fn entries(&self, op: &'static str) -> MutexGuard<'_, HashMap<String, StoredTransient>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!(
                op,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "recovered transient map after a panic"
            );
            poisoned.into_inner()
        })
    }
}

impl TransientStore for MemoryTransientStore {
    fn get(&self, key: &str) -> Result<Option<Value>, InfraError> {
        let entries = self.entries("get");
        Ok(entries
            .get(key)
            .filter(|stored| u64::from(unix_now()) <= stored.expires_at)
            .map(|stored| stored.value.clone()))
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), InfraError> {
        self.entries("set")
            .insert(key.to_string(), StoredTransient::new(value, ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        self.entries("delete").remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: TransientUpdate<'_>,
    ) -> Result<Option<Value>, InfraError> {
        let mut entries = self.entries("update");
        let current = entries.remove(key).and_then(StoredTransient::live);
        let next = f(current);
        if let Some(value) = next.clone() {
            entries.insert(key.to_string(), StoredTransient::new(value, ttl));
        }
        Ok(next)
    }
}

/// Directory holding file transients for a state root.
pub fn transient_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("transients")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn stores(dir: &TempDir) -> Vec<Box<dyn TransientStore>> {
        vec![
            Box::new(FileTransientStore::new(dir.path())),
            Box::new(MemoryTransientStore::new()),
        ]
    }

    #[test]
    fn set_get_delete() {
        let dir = TempDir::new().expect("temp dir");
        for store in stores(&dir) {
            assert_eq!(store.get("k").expect("get"), None);
            store.set("k", json!(["a"]), DAY).expect("set");
            assert_eq!(store.get("k").expect("get"), Some(json!(["a"])));
            store.delete("k").expect("delete");
            assert_eq!(store.get("k").expect("get"), None);
        }
    }

    #[test]
    fn expired_values_read_as_absent() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTransientStore::new(dir.path());
        let stale = StoredTransient {
            expires_at: 1,
            value: json!(1),
        };
        std::fs::write(
            store.path_for("old"),
            serde_json::to_vec(&stale).expect("encode"),
        )
        .expect("write");
        assert_eq!(store.get("old").expect("get"), None);
    }

    #[test]
    fn update_merges_and_deletes() {
        let dir = TempDir::new().expect("temp dir");
        for store in stores(&dir) {
            store.set("list", json!([1]), DAY).expect("set");
            let merged = store
                .update("list", DAY, &mut |current| {
                    let mut items = current
                        .and_then(|value| value.as_array().cloned())
                        .unwrap_or_default();
                    items.push(json!(2));
                    Some(Value::Array(items))
                })
                .expect("update");
            assert_eq!(merged, Some(json!([1, 2])));
            assert_eq!(store.get("list").expect("get"), Some(json!([1, 2])));

            store.update("list", DAY, &mut |_| None).expect("clear");
            assert_eq!(store.get("list").expect("get"), None);
        }
    }

    #[test]
    fn keys_are_sanitized_into_file_names() {
        let store = FileTransientStore::new("/state");
        assert_eq!(
            store.path_for("lx/pending purge"),
            PathBuf::from("/state/lx_pending_purge.json")
        );
    }
}
