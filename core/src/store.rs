//! Persistent preference storage.
//!
//! The backend treats stored bytes as opaque; only the preference
//! serializer ever interprets them. Keys are supplied by frontends,
//! typically one per user profile.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Opaque identifier for a stored preference blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub String);

impl StateKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing has ever been written under the requested key.
    #[error("no state for key")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Read/write access to opaque per-key byte blobs.
pub trait StateStore: Send + Sync {
    fn read_state(&self, key: &StateKey) -> Result<Vec<u8>, StoreError>;
    fn write_state(&self, key: &StateKey, bytes: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<StateKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read_state(&self, key: &StateKey) -> Result<Vec<u8>, StoreError> {
        self.data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn write_state(&self, key: &StateKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.data.lock().unwrap().insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

/// All keys in one JSON file, blobs base64-encoded. Writes go to a
/// temporary file first and are renamed into place so a crash never
/// leaves a half-written store.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let cache = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn persist(&self, cache: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(cache).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn read_state(&self, key: &StateKey) -> Result<Vec<u8>, StoreError> {
        let cache = self.cache.lock().unwrap();
        let blob = cache.get(&key.0).ok_or(StoreError::NotFound)?;
        BASE64
            .decode(blob)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write_state(&self, key: &StateKey, bytes: &[u8]) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.0.clone(), BASE64.encode(bytes));
        self.persist(&cache)
    }
}
