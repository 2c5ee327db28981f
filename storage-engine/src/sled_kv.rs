use shared::{Error, Result};
use std::path::Path;
use tsiskari::ports::KeyValueStore;

/// Sled-backed persisted client state (what a browser keeps in
/// localStorage). Every write is flushed before returning.
pub struct SledKeyValueStore {
    db: sled::Db,
}

impl SledKeyValueStore {
    /// Open the store at `path`, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("Failed to create directory: {}", e)))?;
        }

        let db = sled::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open Sled database: {}", e)))?;

        Ok(Self { db })
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| Error::Internal(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

impl KeyValueStore for SledKeyValueStore {
    /// Value stored under `key`, which must be UTF-8.
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| Error::Internal(format!("Failed to read {key}: {}", e)))?;

        value
            .map(|bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::Internal(format!("{key} is not valid UTF-8: {}", e)))
            })
            .transpose()
    }

    /// Insert or overwrite `key`, durable once this returns.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| Error::Internal(format!("Failed to write {key}: {}", e)))?;
        self.flush()
    }

    /// Delete `key`. Returns whether it was present.
    fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| Error::Internal(format!("Failed to remove {key}: {}", e)))?
            .is_some();
        self.flush()?;
        Ok(removed)
    }
}
