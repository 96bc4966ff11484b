//! Error types for storage operations

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Slot not found: {0:#x}")]
    SlotNotFound(u64),

    #[error("Record in use: slot {0:#x} cannot hold {1} bytes")]
    RecordInUse(u64, usize),

    #[error("Corrupt page {0}: checksum mismatch")]
    Corrupt(u64),

    #[error("Record not in cache: {0:#x}")]
    NotInCache(u64),

    #[error("Record too large: {0} bytes exceed slot capacity {1}")]
    RecordTooLarge(usize, usize),

    #[error("Invalid storage file: {0}")]
    InvalidFile(String),

    #[error("Storage manager is closed: {0}")]
    Closed(String),

    #[error("Unknown root id: {0}")]
    UnknownRoot(u8),
}
