//! Byte-store abstraction consumed by the kernel.

use crate::error::EnvError;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Durable key-value storage.
///
/// Implementations must be thread-safe, and a successful `put`/`delete`
/// must survive a restart.
pub trait ByteStore: Send + Sync {
    /// Returns the value for `key`, or `None` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EnvError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EnvError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), EnvError>;

    /// Captures a consistent point-in-time view of the store.
    fn snapshot(&self) -> Result<StoreSnapshot, EnvError>;
}

/// An owned, point-in-time copy of a store's contents.
///
/// Later writes to the store are not visible through the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl StoreSnapshot {
    /// Builds a snapshot from key/value pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Returns the value captured for `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

/// In-memory `ByteStore` (for testing and simulation).
///
/// Not durable: contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EnvError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EnvError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EnvError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<StoreSnapshot, EnvError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(StoreSnapshot {
            entries: entries.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get(b"k").unwrap(), None);

        store.put(b"k", b"v1").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v1".to_vec()));

        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);

        // Deleting an absent key is fine
        store.delete(b"missing").unwrap();
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();

        let snap = store.snapshot().unwrap();
        store.put(b"a", b"2").unwrap();
        store.put(b"b", b"3").unwrap();

        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get(b"a"), Some(&b"1"[..]));
        assert_eq!(snap.get(b"b"), None);
    }
}
