//! In-memory graph storage

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use quiver_storage::{MemoryStorageManager, Result, StorageManager};

use super::GraphStorage;

/// Graph storage keeping everything in memory. Used by tests and by
/// databases configured without a data directory.
pub struct MemoryGraphStorage {
    name: String,
    main: RwLock<HashMap<String, String>>,
    main_snapshot: RwLock<HashMap<String, String>>,
    managers: RwLock<HashMap<String, Arc<MemoryStorageManager>>>,
}

impl MemoryGraphStorage {
    pub fn new(name: &str) -> Self {
        MemoryGraphStorage {
            name: name.to_string(),
            main: RwLock::new(HashMap::new()),
            main_snapshot: RwLock::new(HashMap::new()),
            managers: RwLock::new(HashMap::new()),
        }
    }
}

impl GraphStorage for MemoryGraphStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&self) -> Result<HashMap<String, String>> {
        Ok(self.main.read().unwrap().clone())
    }

    fn update_main_db(&self, db: HashMap<String, String>) -> Result<()> {
        *self.main.write().unwrap() = db;
        Ok(())
    }

    fn storage_manager(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<dyn StorageManager>>> {
        {
            let managers = self.managers.read().unwrap();
            if let Some(sm) = managers.get(name) {
                return Ok(Some(Arc::clone(sm) as Arc<dyn StorageManager>));
            }
        }
        if !create {
            return Ok(None);
        }

        let mut managers = self.managers.write().unwrap();
        let sm = managers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStorageManager::new(name)));
        Ok(Some(Arc::clone(sm) as Arc<dyn StorageManager>))
    }

    fn storage_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.managers.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn flush_all(&self) -> Result<()> {
        *self.main_snapshot.write().unwrap() = self.main.read().unwrap().clone();
        for sm in self.managers.read().unwrap().values() {
            sm.flush()?;
        }
        Ok(())
    }

    fn rollback_all(&self) -> Result<()> {
        *self.main.write().unwrap() = self.main_snapshot.read().unwrap().clone();
        for sm in self.managers.read().unwrap().values() {
            sm.rollback()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        for sm in self.managers.read().unwrap().values() {
            sm.close()?;
        }
        Ok(())
    }
}
