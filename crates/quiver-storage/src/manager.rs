//! Storage manager trait

use crate::error::Result;

/// Record-level storage interface.
///
/// A storage manager stores variable-length byte records addressed by an
/// opaque 64-bit location. Implementations:
/// - [`crate::DiskStorageManager`]: chunked records over a slot file
/// - [`crate::MemoryStorageManager`]: HashMap-backed, for tests and
///   ephemeral databases
/// - `DistributedStorageManager` (cluster crate): routes records to the
///   primary owner and its replicas
///
/// All methods take `&self`; implementations serialize access internally
/// so managers can be shared behind `Arc`.
pub trait StorageManager: Send + Sync {
    /// Name of this storage manager.
    fn name(&self) -> &str;

    /// Read a root location. Roots survive restarts and anchor access
    /// structures such as lookup tables.
    fn root(&self, id: u8) -> Result<u64>;

    /// Store a root location.
    fn set_root(&self, id: u8, loc: u64) -> Result<()>;

    /// Store a new record and return its location.
    fn insert(&self, data: &[u8]) -> Result<u64>;

    /// Overwrite the record at `loc`. The location stays valid.
    fn update(&self, loc: u64, data: &[u8]) -> Result<()>;

    /// Read the record at `loc`.
    fn fetch(&self, loc: u64) -> Result<Vec<u8>>;

    /// Read the record at `loc` from the record cache only. Never goes
    /// to disk; returns [`crate::StorageError::NotInCache`] on a miss.
    fn fetch_cached(&self, loc: u64) -> Result<Vec<u8>>;

    /// Delete the record at `loc`.
    fn free(&self, loc: u64) -> Result<()>;

    /// Persist all buffered writes.
    fn flush(&self) -> Result<()>;

    /// Discard all writes since the last flush.
    fn rollback(&self) -> Result<()>;

    /// Flush and release underlying resources. Further calls fail.
    fn close(&self) -> Result<()>;
}
