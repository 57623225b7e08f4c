//! Local key-value storage
//!
//! Stands in for the browser's local storage. Every write is published on a
//! broadcast channel so observers (e.g. session identity changes) are notified
//! instead of polling.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::StorageError;

/// Capacity of the change-notification channel
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEventKind {
    Set,
    Removed,
}

/// A key changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub kind: StorageEventKind,
}

/// String key-value store with change notifications
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Receive an event for every subsequent `set` / `remove`
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

// =============================================================================
// In-memory store
// =============================================================================

pub struct MemoryStore {
    entries: DashMap<String, String>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        publish(&self.events, key, StorageEventKind::Set);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.entries.remove(key).is_some() {
            publish(&self.events, key, StorageEventKind::Removed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// File-backed store
// =============================================================================

/// One JSON file per key under a directory
pub struct FileStore {
    dir: PathBuf,
    events: broadcast::Sender<StorageEvent>,
}

impl FileStore {
    /// Opens (and creates if needed) the storage directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { dir, events })
    }

    /// One file per key; the name is the hex-encoded key, so distinct keys never share a file
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        publish(&self.events, key, StorageEventKind::Set);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                publish(&self.events, key, StorageEventKind::Removed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

fn publish(events: &broadcast::Sender<StorageEvent>, key: &str, kind: StorageEventKind) {
    // no subscribers is fine
    let _ = events.send(StorageEvent {
        key: key.to_string(),
        kind,
    });
}
