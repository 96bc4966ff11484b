//! Integration tests exercising the disk manager through restart cycles

use std::sync::Arc;

use quiver_storage::{DiskStorageManager, PersistentMap, StorageManager};
use tempfile::tempdir;

#[test]
fn persistent_map_over_disk_survives_restart() {
    let dir = tempdir().unwrap();

    {
        let sm: Arc<dyn StorageManager> =
            Arc::new(DiskStorageManager::open(dir.path(), "main.nodeidx").unwrap());
        let mut map = PersistentMap::open(Arc::clone(&sm), 0).unwrap();
        for i in 0..200 {
            map.put(&format!("node-{i}"), i.to_string().into_bytes())
                .unwrap();
        }
        map.remove("node-13").unwrap();
        sm.close().unwrap();
    }

    let sm: Arc<dyn StorageManager> =
        Arc::new(DiskStorageManager::open(dir.path(), "main.nodeidx").unwrap());
    let map = PersistentMap::open(Arc::clone(&sm), 0).unwrap();

    assert_eq!(map.get("node-0").unwrap(), Some(b"0".to_vec()));
    assert_eq!(map.get("node-199").unwrap(), Some(b"199".to_vec()));
    assert_eq!(map.get("node-13").unwrap(), None);
    assert_eq!(map.len().unwrap(), 199);
}

#[test]
fn rollback_discards_unflushed_map_writes() {
    let dir = tempdir().unwrap();
    let sm: Arc<dyn StorageManager> =
        Arc::new(DiskStorageManager::open(dir.path(), "main.nodeidx").unwrap());

    let mut map = PersistentMap::open(Arc::clone(&sm), 0).unwrap();
    map.put("committed", b"1".to_vec()).unwrap();
    sm.flush().unwrap();

    map.put("uncommitted", b"2".to_vec()).unwrap();
    sm.rollback().unwrap();

    // Reopen the map from the rolled-back state.
    let map = PersistentMap::open(Arc::clone(&sm), 0).unwrap();
    assert_eq!(map.get("committed").unwrap(), Some(b"1".to_vec()));
    assert_eq!(map.get("uncommitted").unwrap(), None);
}

#[test]
fn many_managers_in_one_directory() {
    let dir = tempdir().unwrap();

    let names = ["main.nodes", "main.edges", "main.nodeidx", "main.edgeidx"];
    let managers: Vec<DiskStorageManager> = names
        .iter()
        .map(|n| DiskStorageManager::open(dir.path(), n).unwrap())
        .collect();

    let locs: Vec<u64> = managers
        .iter()
        .map(|m| m.insert(m.name().as_bytes()).unwrap())
        .collect();

    for (m, loc) in managers.iter().zip(&locs) {
        assert_eq!(m.fetch(*loc).unwrap(), m.name().as_bytes());
    }
}
