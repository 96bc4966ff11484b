//! Full-text and value index
//!
//! Per kind storage the index maintains, for every indexed attribute:
//!
//! 1. A value index: exact canonical value → set of entity keys.
//! 2. A word index: token → entity key → 1-based token positions.
//!
//! Phrase lookup is answered from the word index by checking that the
//! phrase's tokens occur at consecutive positions. Index updates are
//! idempotent: re-indexing an unchanged value is a no-op. On entity
//! removal the index entries go before the record itself; on update the
//! record is written first.

pub mod tokenizer;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quiver_storage::{PersistentMap, StorageManager};

use crate::data::{
    ATTR_END1_CASCADING, ATTR_END1_KEY, ATTR_END1_KIND, ATTR_END1_ROLE, ATTR_END2_CASCADING,
    ATTR_END2_KEY, ATTR_END2_KIND, ATTR_END2_ROLE, ATTR_KEY, ATTR_KIND,
};
use crate::error::{GraphError, Result};
use crate::value::Value;

use tokenizer::tokenize;

/// Attributes that are never indexed: identity and edge endpoint
/// bookkeeping.
const NOT_INDEXED: &[&str] = &[
    ATTR_KEY,
    ATTR_KIND,
    ATTR_END1_KEY,
    ATTR_END1_KIND,
    ATTR_END1_ROLE,
    ATTR_END1_CASCADING,
    ATTR_END2_KEY,
    ATTR_END2_KIND,
    ATTR_END2_ROLE,
    ATTR_END2_CASCADING,
];

type WordEntry = BTreeMap<String, Vec<u32>>;
type ValueEntry = BTreeSet<String>;

/// Index over the entities of one `(partition, kind)` storage.
pub struct IndexManager {
    map: PersistentMap,
}

impl IndexManager {
    /// Open the index anchored at `root_id` of the given index storage
    /// manager.
    pub fn open(sm: Arc<dyn StorageManager>, root_id: u8) -> Result<Self> {
        Ok(IndexManager {
            map: PersistentMap::open(sm, root_id)?,
        })
    }

    fn value_key(attr: &str, value: &Value) -> String {
        format!("v\x00{attr}\x00{}", value.canonical_string())
    }

    fn word_key(attr: &str, word: &str) -> String {
        format!("w\x00{attr}\x00{word}")
    }

    fn indexable(attr: &str) -> bool {
        !NOT_INDEXED.contains(&attr)
    }

    /// Add index entries for every indexable attribute of an entity.
    pub fn index_entity(
        &mut self,
        key: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<()> {
        for (attr, value) in attrs {
            if Self::indexable(attr) {
                self.index_attr(key, attr, value)?;
            }
        }
        Ok(())
    }

    /// Remove all index entries of an entity.
    pub fn deindex_entity(
        &mut self,
        key: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<()> {
        for (attr, value) in attrs {
            if Self::indexable(attr) {
                self.deindex_attr(key, attr, value)?;
            }
        }
        Ok(())
    }

    /// Move the index entries of an entity from its old attribute set
    /// to its new one. Attributes whose value is unchanged are left
    /// untouched.
    pub fn reindex_entity(
        &mut self,
        key: &str,
        old_attrs: &BTreeMap<String, Value>,
        new_attrs: &BTreeMap<String, Value>,
    ) -> Result<()> {
        for (attr, old_value) in old_attrs {
            if !Self::indexable(attr) {
                continue;
            }
            match new_attrs.get(attr) {
                Some(new_value) if new_value == old_value => {}
                _ => self.deindex_attr(key, attr, old_value)?,
            }
        }
        for (attr, new_value) in new_attrs {
            if !Self::indexable(attr) {
                continue;
            }
            match old_attrs.get(attr) {
                Some(old_value) if old_value == new_value => {}
                _ => self.index_attr(key, attr, new_value)?,
            }
        }
        Ok(())
    }

    fn index_attr(&mut self, key: &str, attr: &str, value: &Value) -> Result<()> {
        let vkey = Self::value_key(attr, value);
        let mut entry: ValueEntry = match self.map.get(&vkey)? {
            Some(data) => bincode::deserialize(&data)?,
            None => BTreeSet::new(),
        };
        if entry.insert(key.to_string()) {
            self.map.put(&vkey, bincode::serialize(&entry)?)?;
        }

        if let Value::Str(text) = value {
            let mut positions: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            for (word, pos) in tokenize(text) {
                positions.entry(word).or_default().push(pos);
            }
            for (word, pos_list) in positions {
                let wkey = Self::word_key(attr, &word);
                let mut entry: WordEntry = match self.map.get(&wkey)? {
                    Some(data) => bincode::deserialize(&data)?,
                    None => BTreeMap::new(),
                };
                if entry.get(key) != Some(&pos_list) {
                    entry.insert(key.to_string(), pos_list);
                    self.map.put(&wkey, bincode::serialize(&entry)?)?;
                }
            }
        }
        Ok(())
    }

    fn deindex_attr(&mut self, key: &str, attr: &str, value: &Value) -> Result<()> {
        let vkey = Self::value_key(attr, value);
        if let Some(data) = self.map.get(&vkey)? {
            let mut entry: ValueEntry = bincode::deserialize(&data)?;
            if entry.remove(key) {
                if entry.is_empty() {
                    self.map.remove(&vkey)?;
                } else {
                    self.map.put(&vkey, bincode::serialize(&entry)?)?;
                }
            }
        }

        if let Value::Str(text) = value {
            let words: BTreeSet<String> =
                tokenize(text).into_iter().map(|(w, _)| w).collect();
            for word in words {
                let wkey = Self::word_key(attr, &word);
                let data = self.map.get(&wkey)?.ok_or_else(|| {
                    GraphError::Index(format!("missing word entry for {word:?}"))
                })?;
                let mut entry: WordEntry = bincode::deserialize(&data)?;
                if entry.remove(key).is_some() {
                    if entry.is_empty() {
                        self.map.remove(&wkey)?;
                    } else {
                        self.map.put(&wkey, bincode::serialize(&entry)?)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Keys of entities whose attribute equals `value` exactly.
    pub fn lookup_value(&self, attr: &str, value: &Value) -> Result<Vec<String>> {
        match self.map.get(&Self::value_key(attr, value))? {
            Some(data) => {
                let entry: ValueEntry = bincode::deserialize(&data)?;
                Ok(entry.into_iter().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Positions of `word` per entity key.
    pub fn lookup_word(&self, attr: &str, word: &str) -> Result<BTreeMap<String, Vec<u32>>> {
        match self.map.get(&Self::word_key(attr, &word.to_lowercase()))? {
            Some(data) => Ok(bincode::deserialize(&data)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Keys of entities whose attribute contains `phrase`: all words of
    /// the phrase at consecutive positions.
    pub fn lookup_phrase(&self, attr: &str, phrase: &str) -> Result<Vec<String>> {
        let words: Vec<String> = tokenize(phrase).into_iter().map(|(w, _)| w).collect();
        if words.is_empty() {
            return self.lookup_value(attr, &Value::Str(phrase.to_string()));
        }

        let first = self.lookup_word(attr, &words[0])?;
        let mut result = Vec::new();

        'keys: for (key, starts) in first {
            let mut candidates = starts;
            for (i, word) in words.iter().enumerate().skip(1) {
                let positions = self.lookup_word(attr, word)?;
                let Some(next) = positions.get(&key) else {
                    continue 'keys;
                };
                candidates.retain(|start| next.contains(&(start + i as u32)));
                if candidates.is_empty() {
                    continue 'keys;
                }
            }
            result.push(key);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_storage::MemoryStorageManager;

    fn fresh() -> IndexManager {
        let sm: Arc<dyn StorageManager> = Arc::new(MemoryStorageManager::new("test.nodeidx"));
        IndexManager::open(sm, 1).unwrap()
    }

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn value_lookup() {
        let mut idx = fresh();
        idx.index_entity("000", &attrs(&[("name", Value::from("John"))]))
            .unwrap();
        idx.index_entity("001", &attrs(&[("name", Value::from("John"))]))
            .unwrap();

        assert_eq!(
            idx.lookup_value("name", &Value::from("John")).unwrap(),
            vec!["000".to_string(), "001".to_string()]
        );
        assert!(idx
            .lookup_value("name", &Value::from("Jane"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn word_positions() {
        let mut idx = fresh();
        let desc = "One of the most popular acoustic artists of the decade \
                    and one of its best-selling artists.";
        idx.index_entity("000", &attrs(&[("desc", Value::from(desc))]))
            .unwrap();

        let positions = idx.lookup_word("desc", "artists").unwrap();
        assert_eq!(positions.get("000"), Some(&vec![7, 17]));

        // Lookup is case-insensitive like indexing.
        let upper = idx.lookup_word("desc", "ARTISTS").unwrap();
        assert_eq!(upper.get("000"), Some(&vec![7, 17]));
    }

    #[test]
    fn phrase_lookup_requires_consecutive_words() {
        let mut idx = fresh();
        let desc = "One of the most popular acoustic artists of the decade \
                    and one of its best-selling artists.";
        idx.index_entity("000", &attrs(&[("desc", Value::from(desc))]))
            .unwrap();

        assert_eq!(
            idx.lookup_phrase("desc", "best-selling artists").unwrap(),
            vec!["000".to_string()]
        );
        assert_eq!(
            idx.lookup_phrase("desc", "the decade and").unwrap(),
            vec!["000".to_string()]
        );
        assert!(idx
            .lookup_phrase("desc", "popular decade")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reindex_moves_entries() {
        let mut idx = fresh();
        let old = attrs(&[("name", Value::from("old words"))]);
        let new = attrs(&[("name", Value::from("new words"))]);

        idx.index_entity("000", &old).unwrap();
        idx.reindex_entity("000", &old, &new).unwrap();

        assert!(idx.lookup_word("name", "old").unwrap().is_empty());
        assert_eq!(
            idx.lookup_word("name", "new").unwrap().get("000"),
            Some(&vec![1])
        );
        // "words" survived the reindex.
        assert_eq!(
            idx.lookup_word("name", "words").unwrap().get("000"),
            Some(&vec![2])
        );
    }

    #[test]
    fn deindex_shrinks_sets_monotonically() {
        let mut idx = fresh();
        let a = attrs(&[("name", Value::from("shared term"))]);
        idx.index_entity("000", &a).unwrap();
        idx.index_entity("001", &a).unwrap();

        idx.deindex_entity("000", &a).unwrap();
        assert_eq!(
            idx.lookup_phrase("name", "shared term").unwrap(),
            vec!["001".to_string()]
        );

        idx.deindex_entity("001", &a).unwrap();
        assert!(idx.lookup_phrase("name", "shared term").unwrap().is_empty());
    }

    #[test]
    fn indexing_is_idempotent() {
        let mut idx = fresh();
        let a = attrs(&[("name", Value::from("same"))]);
        idx.index_entity("000", &a).unwrap();
        idx.index_entity("000", &a).unwrap();

        idx.deindex_entity("000", &a).unwrap();
        assert!(idx.lookup_value("name", &Value::from("same")).unwrap().is_empty());
    }
}
