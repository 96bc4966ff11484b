//! Error types for graph operations

use std::collections::BTreeMap;

use quiver_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    /// Malformed partition, kind, key or traversal spec. The operation
    /// was not attempted.
    #[error("Invalid data ({0})")]
    InvalidData(String),

    /// An entity that must exist is absent. Fetch and remove operations
    /// return `Ok(None)` instead; updates surface this error.
    #[error("Not found ({0})")]
    NotFound(String),

    /// Inverted index inconsistency. Fatal for the containing
    /// transaction.
    #[error("Index error: {0}")]
    Index(String),

    /// Record IO failure. Fatal for the containing transaction.
    #[error("Graph storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A rule's pre- or post-hook errored.
    #[error("Rule error in {rule}: {source}")]
    Rule {
        rule: String,
        #[source]
        source: Box<GraphError>,
    },

    /// Sentinel: a rule performed the default action itself. Not a
    /// failure; callers suppress it by identity.
    #[error("Event handled")]
    EventHandled,

    /// Sentinel for external interpreters: an event sink supplied a
    /// canned response for an outer layer to return.
    #[error("Web event handled (status {status})")]
    WebEventHandled {
        status: u16,
        header: BTreeMap<String, String>,
        body: String,
    },
}
