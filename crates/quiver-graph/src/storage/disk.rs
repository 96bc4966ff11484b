//! Disk-backed graph storage
//!
//! Every storage manager lives in its own slot file inside the data
//! directory; the main db is a separate `main.db` file written on
//! `flush_all`. Between flushes the main db is held in memory so a
//! rollback can revert it together with the record files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use quiver_storage::{DiskStorageManager, Result, StorageManager};

use super::GraphStorage;

const MAIN_DB_FILE: &str = "main.db";

/// Graph storage over a data directory.
pub struct DiskGraphStorage {
    name: String,
    dir: PathBuf,
    main: RwLock<HashMap<String, String>>,
    managers: RwLock<HashMap<String, Arc<DiskStorageManager>>>,
}

impl DiskGraphStorage {
    /// Open or create a graph storage in `dir`. Existing storage
    /// managers are discovered from the directory contents.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "graph".to_string());

        let main_path = dir.join(MAIN_DB_FILE);
        let main = if main_path.exists() {
            bincode::deserialize(&fs::read(&main_path)?)
                .map_err(quiver_storage::StorageError::Serialization)?
        } else {
            HashMap::new()
        };

        let mut managers = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let fname = entry.file_name().to_string_lossy().to_string();
            if fname == MAIN_DB_FILE || !entry.file_type()?.is_file() {
                continue;
            }
            managers.insert(
                fname.clone(),
                Arc::new(DiskStorageManager::open(&dir, &fname)?),
            );
        }

        Ok(DiskGraphStorage {
            name,
            dir,
            main: RwLock::new(main),
            managers: RwLock::new(managers),
        })
    }

    fn write_main_db(&self) -> Result<()> {
        let main = self.main.read().unwrap();
        let data =
            bincode::serialize(&*main).map_err(quiver_storage::StorageError::Serialization)?;
        fs::write(self.dir.join(MAIN_DB_FILE), data)?;
        Ok(())
    }

    fn read_main_db(&self) -> Result<HashMap<String, String>> {
        let path = self.dir.join(MAIN_DB_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        bincode::deserialize(&fs::read(path)?)
            .map_err(quiver_storage::StorageError::Serialization)
    }
}

impl GraphStorage for DiskGraphStorage {
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

        let sm = Arc::new(DiskStorageManager::open(&self.dir, name)?);
        let mut managers = self.managers.write().unwrap();
        let sm = managers.entry(name.to_string()).or_insert(sm);
        Ok(Some(Arc::clone(sm) as Arc<dyn StorageManager>))
    }

    fn storage_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.managers.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn flush_all(&self) -> Result<()> {
        self.write_main_db()?;
        for sm in self.managers.read().unwrap().values() {
            sm.flush()?;
        }
        Ok(())
    }

    fn rollback_all(&self) -> Result<()> {
        *self.main.write().unwrap() = self.read_main_db()?;
        for sm in self.managers.read().unwrap().values() {
            sm.rollback()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.write_main_db()?;
        for sm in self.managers.read().unwrap().values() {
            sm.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reopen_discovers_managers_and_main_db() {
        let dir = tempdir().unwrap();

        {
            let gs = DiskGraphStorage::open(dir.path()).unwrap();
            let sm = gs
                .storage_manager("mainAuthor.nodes", true)
                .unwrap()
                .unwrap();
            sm.insert(b"record").unwrap();

            let mut db = HashMap::new();
            db.insert("node_kinds".to_string(), "Author".to_string());
            gs.update_main_db(db).unwrap();
            gs.close().unwrap();
        }

        let gs = DiskGraphStorage::open(dir.path()).unwrap();
        assert_eq!(
            gs.storage_names().unwrap(),
            vec!["mainAuthor.nodes".to_string()]
        );
        assert_eq!(
            gs.main_db().unwrap().get("node_kinds"),
            Some(&"Author".to_string())
        );
        assert!(gs
            .storage_manager("mainAuthor.nodes", false)
            .unwrap()
            .is_some());
    }
}
