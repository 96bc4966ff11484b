//! Graph storage bundles
//!
//! A graph storage groups the storage managers of one database under a
//! name. Managers are addressed by logical names built from partition,
//! kind and a suffix (e.g. `mainAuthor.nodes`). The bundle also holds
//! the main db: a small string map with the kind registries and counts.

mod disk;
mod memory;

pub use disk::DiskGraphStorage;
pub use memory::MemoryGraphStorage;

use std::collections::HashMap;
use std::sync::Arc;

use quiver_storage::{Result, StorageManager};

/// Suffix of the node record storage of a kind.
pub const SUFFIX_NODES: &str = ".nodes";

/// Suffix of the edge record storage of a kind.
pub const SUFFIX_EDGES: &str = ".edges";

/// Suffix of the node lookup/index storage of a kind.
pub const SUFFIX_NODE_INDEX: &str = ".nodeidx";

/// Suffix of the edge lookup/index storage of a kind.
pub const SUFFIX_EDGE_INDEX: &str = ".edgeidx";

/// Suffix of the binary blob storage of a partition.
pub const SUFFIX_BLOB: &str = ".blob";

/// Logical storage manager name for a partition, kind and suffix.
pub fn manager_name(partition: &str, kind: &str, suffix: &str) -> String {
    format!("{partition}{kind}{suffix}")
}

/// Bundle of storage managers plus the main db.
pub trait GraphStorage: Send + Sync {
    /// Name of the database.
    fn name(&self) -> &str;

    /// Snapshot of the main db map.
    fn main_db(&self) -> Result<HashMap<String, String>>;

    /// Replace the main db map. Persisted on the next `flush_all`.
    fn update_main_db(&self, db: HashMap<String, String>) -> Result<()>;

    /// Get a storage manager by logical name. With `create` false,
    /// absent managers yield `None` instead of being created.
    fn storage_manager(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<dyn StorageManager>>>;

    /// Names of all existing storage managers.
    fn storage_names(&self) -> Result<Vec<String>>;

    /// Flush the main db and every storage manager.
    fn flush_all(&self) -> Result<()>;

    /// Revert the main db and every storage manager to the last flush.
    fn rollback_all(&self) -> Result<()>;

    /// Flush and release all resources.
    fn close(&self) -> Result<()>;
}

/// Names of managers with the given suffix, with the suffix stripped.
pub fn names_with_suffix(storage: &dyn GraphStorage, suffix: &str) -> Result<Vec<String>> {
    Ok(storage
        .storage_names()?
        .into_iter()
        .filter_map(|n| n.strip_suffix(suffix).map(|s| s.to_string()))
        .collect())
}
