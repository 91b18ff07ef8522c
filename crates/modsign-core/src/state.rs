//! Persisted run state behind a small key/value interface.
//!
//! Values are JSON documents. `FileStateStore` keeps one owner-only file per
//! key and serializes writers with an exclusive lock on `.state.lock`, which
//! makes `compare_and_swap` safe across processes.

use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::fsutil;

const STATE_LOCK: &str = ".state.lock";
const STATE_FILE_MODE: u32 = 0o600;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid state key {0:?}")]
    InvalidKey(String),
    #[error("state record {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state write failed: {0}")]
    Write(String),
}

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StateError>;
    /// Returns whether a value was present.
    fn remove(&self, key: &str) -> Result<bool, StateError>;
    /// Replace the value only if the current one equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> Result<bool, StateError>;
    /// Delete every record. Returns the number removed.
    fn clear(&self) -> Result<usize, StateError>;
}

/// Typed access on top of the JSON interface.
pub trait StateStoreExt: StateStore {
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StateError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        self.set(key, &serde_json::to_value(value)?)
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

fn validate_key(key: &str) -> Result<(), StateError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidKey(key.to_string()))
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StateError> {
        let root = root.as_ref().to_path_buf();
        fsutil::ensure_private_dir(&root).map_err(|e| StateError::Write(format!("{e:#}")))?;
        fsutil::cleanup_staging(&root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StateError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    fn exclusive(&self) -> Result<StateLock, StateError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(STATE_LOCK))?;
        file.lock_exclusive()?;
        Ok(StateLock { file })
    }

    fn read(&self, key: &str) -> Result<Option<Value>, StateError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StateError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), StateError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        fsutil::write_atomic(&path, &bytes, Some(STATE_FILE_MODE))
            .map_err(|e| StateError::Write(format!("{e:#}")))
    }
}

struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        self.read(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StateError> {
        let _lock = self.exclusive()?;
        self.write(key, value)
    }

    fn remove(&self, key: &str) -> Result<bool, StateError> {
        let path = self.path_for(key)?;
        let _lock = self.exclusive()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> Result<bool, StateError> {
        let _lock = self.exclusive()?;
        // A corrupt record never matches an expectation.
        let current = match self.read(key) {
            Ok(v) => v,
            Err(StateError::Corrupt { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if current.as_ref() != expected {
            return Ok(false);
        }
        self.write(key, new)?;
        Ok(true)
    }

    fn clear(&self) -> Result<usize, StateError> {
        let _lock = self.exclusive()?;
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        validate_key(key)?;
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StateError> {
        validate_key(key)?;
        self.values.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StateError> {
        validate_key(key)?;
        Ok(self.values.lock().remove(key).is_some())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> Result<bool, StateError> {
        validate_key(key)?;
        let mut values = self.values.lock();
        if values.get(key) != expected {
            return Ok(false);
        }
        values.insert(key.to_string(), new.clone());
        Ok(true)
    }

    fn clear(&self) -> Result<usize, StateError> {
        let mut values = self.values.lock();
        let n = values.len();
        values.clear();
        Ok(n)
    }
}
