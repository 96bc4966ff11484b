//! Persistent hash map over a storage manager
//!
//! Keys are strings, values are raw bytes. The map keeps a directory
//! record of bucket locations anchored at a storage root; each bucket is
//! a record holding the `(key, value)` pairs whose key hashes into it.
//! The directory is cached in memory and written through on change.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manager::StorageManager;
use crate::stable_hash;

const NUM_BUCKETS: usize = 128;

#[derive(Serialize, Deserialize)]
struct Directory {
    buckets: Vec<u64>,
}

type Bucket = Vec<(String, Vec<u8>)>;

/// String-keyed persistent map.
pub struct PersistentMap {
    sm: Arc<dyn StorageManager>,
    dir_loc: u64,
    buckets: Vec<u64>,
}

impl PersistentMap {
    /// Open the map anchored at root `root_id`, creating the directory
    /// record on first use.
    pub fn open(sm: Arc<dyn StorageManager>, root_id: u8) -> Result<Self> {
        let mut dir_loc = sm.root(root_id)?;

        let buckets = if dir_loc == 0 {
            let dir = Directory {
                buckets: vec![0; NUM_BUCKETS],
            };
            dir_loc = sm.insert(&bincode::serialize(&dir)?)?;
            sm.set_root(root_id, dir_loc)?;
            dir.buckets
        } else {
            let dir: Directory = bincode::deserialize(&sm.fetch(dir_loc)?)?;
            dir.buckets
        };

        Ok(PersistentMap {
            sm,
            dir_loc,
            buckets,
        })
    }

    fn bucket_index(key: &str) -> usize {
        (stable_hash(key.as_bytes()) % NUM_BUCKETS as u64) as usize
    }

    fn load_bucket(&self, loc: u64) -> Result<Bucket> {
        Ok(bincode::deserialize(&self.sm.fetch(loc)?)?)
    }

    fn store_directory(&self) -> Result<()> {
        let dir = Directory {
            buckets: self.buckets.clone(),
        };
        self.sm.update(self.dir_loc, &bincode::serialize(&dir)?)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let loc = self.buckets[Self::bucket_index(key)];
        if loc == 0 {
            return Ok(None);
        }
        let bucket = self.load_bucket(loc)?;
        Ok(bucket
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Insert or overwrite the value under `key`. Returns the previous
    /// value if there was one.
    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let bi = Self::bucket_index(key);
        let loc = self.buckets[bi];

        if loc == 0 {
            let bucket: Bucket = vec![(key.to_string(), value)];
            let new_loc = self.sm.insert(&bincode::serialize(&bucket)?)?;
            self.buckets[bi] = new_loc;
            self.store_directory()?;
            return Ok(None);
        }

        let mut bucket = self.load_bucket(loc)?;
        let old = match bucket.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                bucket.push((key.to_string(), value));
                None
            }
        };
        self.sm.update(loc, &bincode::serialize(&bucket)?)?;
        Ok(old)
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let bi = Self::bucket_index(key);
        let loc = self.buckets[bi];
        if loc == 0 {
            return Ok(None);
        }

        let mut bucket = self.load_bucket(loc)?;
        let pos = bucket.iter().position(|(k, _)| k == key);
        match pos {
            Some(i) => {
                let (_, value) = bucket.remove(i);
                self.sm.update(loc, &bincode::serialize(&bucket)?)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Number of stored entries. Walks every bucket.
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for loc in &self.buckets {
            if *loc != 0 {
                count += self.load_bucket(*loc)?.len();
            }
        }
        Ok(count)
    }

    /// True if the map holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lazy iterator over all entries.
    ///
    /// The iterator loads one bucket at a time and reflects the buckets
    /// as they are when visited; entries written after creation may or
    /// may not appear.
    pub fn iter(&self) -> PersistentMapIter {
        PersistentMapIter {
            sm: Arc::clone(&self.sm),
            buckets: self.buckets.clone(),
            next_bucket: 0,
            current: Vec::new(),
        }
    }
}

/// Iterator over the entries of a [`PersistentMap`].
pub struct PersistentMapIter {
    sm: Arc<dyn StorageManager>,
    buckets: Vec<u64>,
    next_bucket: usize,
    current: Bucket,
}

impl Iterator for PersistentMapIter {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((k, v)) = self.current.pop() {
                return Some(Ok((k, v)));
            }
            if self.next_bucket >= self.buckets.len() {
                return None;
            }
            let loc = self.buckets[self.next_bucket];
            self.next_bucket += 1;
            if loc == 0 {
                continue;
            }
            match self.sm.fetch(loc) {
                Ok(data) => match bincode::deserialize::<Bucket>(&data) {
                    Ok(bucket) => self.current = bucket,
                    Err(err) => return Some(Err(err.into())),
                },
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorageManager;

    fn fresh() -> PersistentMap {
        let sm: Arc<dyn StorageManager> = Arc::new(MemoryStorageManager::new("test.map"));
        PersistentMap::open(sm, 0).unwrap()
    }

    #[test]
    fn put_get_remove() {
        let mut map = fresh();

        assert_eq!(map.put("alpha", b"1".to_vec()).unwrap(), None);
        assert_eq!(map.get("alpha").unwrap(), Some(b"1".to_vec()));

        assert_eq!(
            map.put("alpha", b"2".to_vec()).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(map.get("alpha").unwrap(), Some(b"2".to_vec()));

        assert_eq!(map.remove("alpha").unwrap(), Some(b"2".to_vec()));
        assert_eq!(map.get("alpha").unwrap(), None);
        assert_eq!(map.remove("alpha").unwrap(), None);
    }

    #[test]
    fn iterates_all_entries() {
        let mut map = fresh();
        for i in 0..50 {
            map.put(&format!("key{i}"), vec![i as u8]).unwrap();
        }

        let mut seen: Vec<String> = map.iter().map(|e| e.unwrap().0).collect();
        seen.sort();
        assert_eq!(seen.len(), 50);
        assert_eq!(seen[0], "key0");
    }

    #[test]
    fn survives_reopen_on_same_manager() {
        let sm: Arc<dyn StorageManager> = Arc::new(MemoryStorageManager::new("test.map"));

        let mut map = PersistentMap::open(Arc::clone(&sm), 0).unwrap();
        map.put("durable", b"yes".to_vec()).unwrap();
        drop(map);

        let map = PersistentMap::open(sm, 0).unwrap();
        assert_eq!(map.get("durable").unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn len_counts_entries() {
        let mut map = fresh();
        assert!(map.is_empty().unwrap());
        map.put("a", vec![]).unwrap();
        map.put("b", vec![]).unwrap();
        assert_eq!(map.len().unwrap(), 2);
    }
}
