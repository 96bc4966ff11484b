//! Disk-backed storage manager
//!
//! Records larger than a slot's payload are split into a continuation
//! chain: every chunk starts with the location of the next chunk (nil for
//! the last one) followed by data. The first chunk's location identifies
//! the record and never changes across updates.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, StorageError};
use crate::manager::StorageManager;
use crate::slots::{SlotFile, DEFAULT_PAGE_SIZE, NIL};

/// Bytes reserved at the start of every chunk for the continuation link.
const CHUNK_LINK_SIZE: usize = 8;

/// Default number of decoded records kept in the record cache.
const DEFAULT_CACHE_RECORDS: usize = 1024;

/// Storage manager over a paged slot file.
pub struct DiskStorageManager {
    name: String,
    slots: Mutex<SlotFile>,
    cache: Mutex<RecordCache>,
}

impl DiskStorageManager {
    /// Open or create the slot file `<dir>/<name>` with the default page
    /// size.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let slots = SlotFile::open(dir.as_ref().join(name), DEFAULT_PAGE_SIZE)?;
        Ok(DiskStorageManager {
            name: name.to_string(),
            slots: Mutex::new(slots),
            cache: Mutex::new(RecordCache::new(DEFAULT_CACHE_RECORDS)),
        })
    }

    fn write_chain(slots: &mut SlotFile, data: &[u8]) -> Result<u64> {
        let chunk_cap = slots.max_record_size() - CHUNK_LINK_SIZE;

        let mut next = NIL;
        if data.len() > chunk_cap {
            for chunk in data[chunk_cap..].chunks(chunk_cap).rev() {
                next = Self::write_chunk(slots, chunk, next)?;
            }
        }
        Self::write_chunk(slots, &data[..data.len().min(chunk_cap)], next)
    }

    fn write_chunk(slots: &mut SlotFile, chunk: &[u8], next: u64) -> Result<u64> {
        let loc = slots.allocate(chunk.len() + CHUNK_LINK_SIZE)?;
        let mut buf = Vec::with_capacity(chunk.len() + CHUNK_LINK_SIZE);
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(chunk);
        slots.write(loc, &buf)?;
        Ok(loc)
    }

    fn read_chunk(slots: &mut SlotFile, loc: u64) -> Result<(u64, Vec<u8>)> {
        let payload = slots.read(loc)?;
        if payload.len() < CHUNK_LINK_SIZE {
            return Err(StorageError::Corrupt(loc >> 16));
        }
        let next = u64::from_le_bytes(payload[..CHUNK_LINK_SIZE].try_into().expect("8 bytes"));
        Ok((next, payload[CHUNK_LINK_SIZE..].to_vec()))
    }

    /// Free every chunk of the chain starting at `loc`.
    fn free_chain(slots: &mut SlotFile, mut loc: u64) -> Result<()> {
        while loc != NIL {
            let (next, _) = Self::read_chunk(slots, loc)?;
            slots.free(loc)?;
            loc = next;
        }
        Ok(())
    }
}

impl StorageManager for DiskStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self, id: u8) -> Result<u64> {
        self.slots.lock().unwrap().root(id)
    }

    fn set_root(&self, id: u8, loc: u64) -> Result<()> {
        self.slots.lock().unwrap().set_root(id, loc)
    }

    fn insert(&self, data: &[u8]) -> Result<u64> {
        let mut slots = self.slots.lock().unwrap();
        let loc = Self::write_chain(&mut slots, data)?;
        drop(slots);
        self.cache.lock().unwrap().put(loc, data.to_vec());
        Ok(loc)
    }

    fn update(&self, loc: u64, data: &[u8]) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();

        // The record keeps its location: the head chunk is rewritten in
        // place, the old tail chain is freed and a new one built.
        let (old_next, _) = Self::read_chunk(&mut slots, loc)?;
        Self::free_chain(&mut slots, old_next)?;

        let head_cap = slots.slot_capacity(loc)? - CHUNK_LINK_SIZE;
        let chunk_cap = slots.max_record_size() - CHUNK_LINK_SIZE;

        let head_len = data.len().min(head_cap);
        let mut next = NIL;
        if data.len() > head_len {
            for chunk in data[head_len..].chunks(chunk_cap).rev() {
                next = Self::write_chunk(&mut slots, chunk, next)?;
            }
        }
        let mut buf = Vec::with_capacity(head_len + CHUNK_LINK_SIZE);
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(&data[..head_len]);
        slots.write(loc, &buf)?;
        drop(slots);

        self.cache.lock().unwrap().put(loc, data.to_vec());
        Ok(())
    }

    fn fetch(&self, loc: u64) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.lock().unwrap().get(loc) {
            return Ok(data);
        }

        let mut slots = self.slots.lock().unwrap();
        let mut data = Vec::new();
        let mut cur = loc;
        while cur != NIL {
            let (next, chunk) = Self::read_chunk(&mut slots, cur)?;
            data.extend_from_slice(&chunk);
            cur = next;
        }
        drop(slots);

        self.cache.lock().unwrap().put(loc, data.clone());
        Ok(data)
    }

    fn fetch_cached(&self, loc: u64) -> Result<Vec<u8>> {
        self.cache
            .lock()
            .unwrap()
            .get(loc)
            .ok_or(StorageError::NotInCache(loc))
    }

    fn free(&self, loc: u64) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        Self::free_chain(&mut slots, loc)?;
        drop(slots);
        self.cache.lock().unwrap().remove(loc);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.slots.lock().unwrap().flush()
    }

    fn rollback(&self) -> Result<()> {
        self.cache.lock().unwrap().clear();
        self.slots.lock().unwrap().rollback()
    }

    fn close(&self) -> Result<()> {
        self.cache.lock().unwrap().clear();
        self.slots.lock().unwrap().close()
    }
}

/// Bounded record cache with insertion-order eviction.
struct RecordCache {
    records: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
    cap: usize,
}

impl RecordCache {
    fn new(cap: usize) -> Self {
        RecordCache {
            records: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn get(&self, loc: u64) -> Option<Vec<u8>> {
        self.records.get(&loc).cloned()
    }

    fn put(&mut self, loc: u64, data: Vec<u8>) {
        if self.records.insert(loc, data).is_none() {
            self.order.push_back(loc);
        }
        while self.records.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.records.remove(&old);
            } else {
                break;
            }
        }
    }

    fn remove(&mut self, loc: u64) {
        self.records.remove(&loc);
        self.order.retain(|l| *l != loc);
    }

    fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}
