//! Lazy node key iteration

use quiver_storage::PersistentMapIter;

use crate::error::Result;

/// A finite, non-restartable sequence of node keys.
///
/// The iterator reflects a snapshot of the key table taken at its
/// creation; keys stored or removed afterwards may or may not appear.
/// Consumers must check each item for an error.
pub struct NodeKeyIterator {
    inner: PersistentMapIter,
}

impl NodeKeyIterator {
    pub(crate) fn new(inner: PersistentMapIter) -> Self {
        NodeKeyIterator { inner }
    }
}

impl Iterator for NodeKeyIterator {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|item| item.map(|(key, _)| key).map_err(Into::into))
    }
}
