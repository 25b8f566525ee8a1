//! Durable byte store backed by sled.
//!
//! Every mutation is flushed before returning, so a successful `put` or
//! `delete` survives a crash.
//!
//! Snapshots are point-in-time with respect to writes made through the
//! store: writers share a gate that a snapshot holds exclusively while it
//! copies the tree. Writes made to the underlying `sled::Db` by other
//! handles are not covered.

use matrix_env::{ByteStore, EnvError, StoreSnapshot};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub struct SledStore {
    db: sled::Db,
    /// Shared by writers, held exclusively by `snapshot`.
    gate: RwLock<()>,
}

impl SledStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EnvError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(EnvError::storage)?;
        debug!(path = %path.display(), "sled store opened");
        Ok(Self::from_db(db))
    }

    /// A store deleted when dropped. Used by tests and ephemeral nodes.
    pub fn temporary() -> Result<Self, EnvError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(EnvError::storage)?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            gate: RwLock::new(()),
        }
    }

    /// Flushes outstanding writes and releases the database.
    pub fn close(self) -> Result<(), EnvError> {
        self.db.flush().map_err(EnvError::storage)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl ByteStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EnvError> {
        let value = self.db.get(key).map_err(EnvError::storage)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EnvError> {
        let _writing = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.db.insert(key, value).map_err(EnvError::storage)?;
        self.db.flush().map_err(EnvError::storage)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EnvError> {
        let _writing = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.db.remove(key).map_err(EnvError::storage)?;
        self.db.flush().map_err(EnvError::storage)?;
        Ok(())
    }

    fn snapshot(&self) -> Result<StoreSnapshot, EnvError> {
        let _exclusive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let entries = self
            .db
            .iter()
            .map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(EnvError::storage)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreSnapshot::from_entries(entries))
    }
}
