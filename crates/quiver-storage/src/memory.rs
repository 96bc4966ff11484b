//! In-memory storage manager for testing and ephemeral databases

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, StorageError};
use crate::manager::StorageManager;

/// In-memory storage manager.
///
/// Fast, non-persistent storage primarily for tests and for databases
/// configured without a data directory. `flush` takes a snapshot that
/// `rollback` restores, mirroring the flush/rollback contract of the
/// disk manager.
pub struct MemoryStorageManager {
    name: String,
    inner: RwLock<MemInner>,
    snapshot: RwLock<MemInner>,
}

#[derive(Clone)]
struct MemInner {
    records: HashMap<u64, Vec<u8>>,
    roots: HashMap<u8, u64>,
    next_loc: u64,
}

impl MemInner {
    fn empty() -> Self {
        MemInner {
            records: HashMap::new(),
            roots: HashMap::new(),
            next_loc: 1,
        }
    }
}

impl MemoryStorageManager {
    /// Create a new empty in-memory storage manager.
    pub fn new(name: &str) -> Self {
        MemoryStorageManager {
            name: name.to_string(),
            inner: RwLock::new(MemInner::empty()),
            snapshot: RwLock::new(MemInner::empty()),
        }
    }
}

impl StorageManager for MemoryStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self, id: u8) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .roots
            .get(&id)
            .copied()
            .unwrap_or(0))
    }

    fn set_root(&self, id: u8, loc: u64) -> Result<()> {
        self.inner.write().unwrap().roots.insert(id, loc);
        Ok(())
    }

    fn insert(&self, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let loc = inner.next_loc;
        inner.next_loc += 1;
        inner.records.insert(loc, data.to_vec());
        Ok(loc)
    }

    fn update(&self, loc: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.records.get_mut(&loc) {
            Some(rec) => {
                *rec = data.to_vec();
                Ok(())
            }
            None => Err(StorageError::SlotNotFound(loc)),
        }
    }

    fn fetch(&self, loc: u64) -> Result<Vec<u8>> {
        self.inner
            .read()
            .unwrap()
            .records
            .get(&loc)
            .cloned()
            .ok_or(StorageError::SlotNotFound(loc))
    }

    fn fetch_cached(&self, loc: u64) -> Result<Vec<u8>> {
        // Everything lives in memory, so the cache is the store itself.
        self.fetch(loc)
    }

    fn free(&self, loc: u64) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .records
            .remove(&loc)
            .map(|_| ())
            .ok_or(StorageError::SlotNotFound(loc))
    }

    fn flush(&self) -> Result<()> {
        *self.snapshot.write().unwrap() = self.inner.read().unwrap().clone();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        *self.inner.write().unwrap() = self.snapshot.read().unwrap().clone();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_roundtrip() {
        let sm = MemoryStorageManager::new("test.nodes");

        let loc = sm.insert(b"value").unwrap();
        assert_eq!(sm.fetch(loc).unwrap(), b"value");

        sm.update(loc, b"updated").unwrap();
        assert_eq!(sm.fetch_cached(loc).unwrap(), b"updated");

        sm.free(loc).unwrap();
        assert!(matches!(
            sm.fetch(loc),
            Err(StorageError::SlotNotFound(_))
        ));
    }

    #[test]
    fn roots_are_stored() {
        let sm = MemoryStorageManager::new("test.nodes");
        assert_eq!(sm.root(3).unwrap(), 0);
        sm.set_root(3, 42).unwrap();
        assert_eq!(sm.root(3).unwrap(), 42);
    }

    #[test]
    fn update_missing_record_fails() {
        let sm = MemoryStorageManager::new("test.nodes");
        assert!(sm.update(99, b"nope").is_err());
    }

    #[test]
    fn rollback_restores_last_flush() {
        let sm = MemoryStorageManager::new("test.nodes");

        let keep = sm.insert(b"keep").unwrap();
        sm.flush().unwrap();

        let drop_loc = sm.insert(b"drop").unwrap();
        sm.rollback().unwrap();

        assert_eq!(sm.fetch(keep).unwrap(), b"keep");
        assert!(sm.fetch(drop_loc).is_err());
    }
}
