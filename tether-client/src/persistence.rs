//! Durable storage for the last event id seen by the client.
//!
//! The store is a plain key-value collaborator. Reads happen once per client, writes on
//! every frame that advances the event id; a failing write is logged by the caller and
//! never interrupts delivery.
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg_attr(test, automock)]
pub trait EventIdStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// Keeps values for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryEventIdStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryEventIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventIdStore for InMemoryEventIdStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Keeps values in a JSON object on disk. The whole map is rewritten on every `set`.
#[derive(Debug)]
pub struct FileEventIdStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileEventIdStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "OpenedEventIdStore");
        Ok(Self { path, values: Mutex::new(values) })
    }
}

impl EventIdStore for FileEventIdStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        let contents = serde_json::to_string(&*values)?;
        // write then rename so a crash never leaves a truncated file behind
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
