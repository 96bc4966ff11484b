//! Error types for cluster operations

use std::io;

use quiver_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Membership problem (unknown target, duplicate name, …).
    #[error("ClusterError: Member error ({0})")]
    Member(String),

    /// A frame failed MAC verification.
    #[error("ClusterError: Authentication failed ({0})")]
    Auth(String),

    /// An RPC exceeded its deadline. The outcome on the remote side is
    /// undefined; idempotent verbs are safe to retry.
    #[error("ClusterError: Timeout ({0})")]
    Timeout(String),

    /// Malformed frame or unexpected response.
    #[error("ClusterError: Protocol error ({0})")]
    Protocol(String),

    /// The remote side reported a failure.
    #[error("ClusterError: Remote error ({0})")]
    Remote(String),

    #[error("ClusterError: IO error ({0})")]
    Io(#[from] io::Error),

    #[error("ClusterError: Encoding error ({0})")]
    Encoding(#[from] bincode::Error),

    #[error("ClusterError: Storage error ({0})")]
    Storage(#[from] StorageError),
}

impl ClusterError {
    /// True for failures where a single retry against a replica makes
    /// sense.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout(_) | ClusterError::Io(_) | ClusterError::Remote(_)
        )
    }
}

impl From<ClusterError> for StorageError {
    fn from(err: ClusterError) -> Self {
        StorageError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}
