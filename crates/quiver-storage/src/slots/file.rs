//! Paged slot file with free-list reuse and a write-back page cache

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

use super::{
    location, offset_of, page_of, Location, MIN_CLASS_EXP, NIL, NUM_CLASSES, NUM_ROOTS,
    SLOT_HEADER_SIZE,
};

const MAGIC: u32 = 0x5156_5253;
const FORMAT_VERSION: u32 = 1;

// Header page layout (page 0)
const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_ROOTS: usize = 24;
const OFF_FREE_HEADS: usize = OFF_ROOTS + NUM_ROOTS * 8;
const HEADER_MIN_SIZE: usize = OFF_FREE_HEADS + NUM_CLASSES * 8;

// Slot state stored in the low byte of the header type field
const STATE_FREE: u32 = 0;
const STATE_LIVE: u32 = 1;

/// Default number of pages held in the write-back cache.
const DEFAULT_CACHE_PAGES: usize = 256;

struct Page {
    data: Vec<u8>,
    dirty: bool,
}

/// Fixed-page slot file.
///
/// All mutation goes through the page cache; `flush` writes dirty pages
/// back and fsyncs. `rollback` discards the cache and reloads the header,
/// reverting to the state of the last flush.
pub struct SlotFile {
    file: Option<File>,
    path: PathBuf,
    page_size: usize,
    page_count: u64,
    version: u64,
    roots: [Location; NUM_ROOTS],
    free_heads: [Location; NUM_CLASSES],
    cache: HashMap<u64, Page>,
    cache_cap: usize,
}

impl SlotFile {
    /// Open or create a slot file at `path`.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        if page_size < HEADER_MIN_SIZE || page_size > 0xffff || !page_size.is_power_of_two() {
            return Err(StorageError::InvalidFile(format!(
                "unsupported page size {page_size}"
            )));
        }

        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();

        let mut sf = SlotFile {
            file: None,
            path,
            page_size,
            page_count: 1,
            version: 0,
            roots: [NIL; NUM_ROOTS],
            free_heads: [NIL; NUM_CLASSES],
            cache: HashMap::new(),
            cache_cap: DEFAULT_CACHE_PAGES,
        };

        if len == 0 {
            sf.file = Some(file);
            sf.write_header()?;
            sf.flush()?;
        } else {
            let mut header = vec![0u8; page_size];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            sf.file = Some(file);
            sf.load_header(&header)?;
            sf.page_count = len / page_size as u64;
        }

        Ok(sf)
    }

    /// File system path of this slot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Largest payload a single slot can hold.
    pub fn max_record_size(&self) -> usize {
        self.page_size - SLOT_HEADER_SIZE
    }

    /// Global version counter, incremented on every page write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Read a root location from the header directory.
    pub fn root(&self, id: u8) -> Result<Location> {
        self.roots
            .get(id as usize)
            .copied()
            .ok_or(StorageError::UnknownRoot(id))
    }

    /// Store a root location in the header directory.
    pub fn set_root(&mut self, id: u8, loc: Location) -> Result<()> {
        if id as usize >= NUM_ROOTS {
            return Err(StorageError::UnknownRoot(id));
        }
        self.roots[id as usize] = loc;
        self.version += 1;
        Ok(())
    }

    /// Allocate a slot big enough for `size` payload bytes.
    ///
    /// The slot comes from the free list of the matching size class, or
    /// from a freshly carved page when the list is empty. The returned
    /// slot is live with length zero until the first `write`.
    pub fn allocate(&mut self, size: usize) -> Result<Location> {
        let exp = self.class_exp_for(size)?;
        let ci = (exp - MIN_CLASS_EXP) as usize;

        if self.free_heads[ci] == NIL {
            self.carve_page(exp)?;
        }

        let loc = self.free_heads[ci];
        let off = offset_of(loc);
        let page = self.page_mut(page_of(loc))?;

        let next = read_u64(&page.data, off + SLOT_HEADER_SIZE);
        write_slot_header(&mut page.data, off, 0, (exp << 8) | STATE_LIVE, 0);
        page.dirty = true;

        self.free_heads[ci] = next;
        self.version += 1;
        Ok(loc)
    }

    /// Write `data` into a live slot.
    pub fn write(&mut self, loc: Location, data: &[u8]) -> Result<()> {
        let off = offset_of(loc);
        self.check_bounds(loc)?;

        let crc = crc32fast::hash(data);
        let page = self.page_mut(page_of(loc))?;

        let (_, typ, _) = read_slot_header(&page.data, off);
        if typ & 0xff != STATE_LIVE {
            return Err(StorageError::SlotNotFound(loc));
        }
        let class = 1usize << (typ >> 8);
        if data.len() + SLOT_HEADER_SIZE > class {
            return Err(StorageError::RecordInUse(loc, data.len()));
        }

        write_slot_header(&mut page.data, off, data.len() as u32, typ, crc);
        page.data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + data.len()]
            .copy_from_slice(data);
        page.dirty = true;
        self.version += 1;
        Ok(())
    }

    /// Read the payload of a live slot. Checksum mismatch reports the
    /// containing page as corrupt.
    pub fn read(&mut self, loc: Location) -> Result<Vec<u8>> {
        let off = offset_of(loc);
        self.check_bounds(loc)?;

        let page_idx = page_of(loc);
        let page = self.page_mut(page_idx)?;

        let (len, typ, crc) = read_slot_header(&page.data, off);
        if typ & 0xff != STATE_LIVE {
            return Err(StorageError::SlotNotFound(loc));
        }
        let class = 1usize << (typ >> 8);
        let len = len as usize;
        if len + SLOT_HEADER_SIZE > class || off + SLOT_HEADER_SIZE + len > page.data.len() {
            return Err(StorageError::Corrupt(page_idx));
        }

        let payload = page.data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + len].to_vec();
        if crc32fast::hash(&payload) != crc {
            return Err(StorageError::Corrupt(page_idx));
        }
        Ok(payload)
    }

    /// Payload capacity of the live slot at `loc`.
    pub fn slot_capacity(&mut self, loc: Location) -> Result<usize> {
        let off = offset_of(loc);
        self.check_bounds(loc)?;
        let page = self.page_mut(page_of(loc))?;
        let (_, typ, _) = read_slot_header(&page.data, off);
        if typ & 0xff != STATE_LIVE {
            return Err(StorageError::SlotNotFound(loc));
        }
        Ok((1usize << (typ >> 8)) - SLOT_HEADER_SIZE)
    }

    /// Return a slot to the free list of its size class.
    pub fn free(&mut self, loc: Location) -> Result<()> {
        let off = offset_of(loc);
        self.check_bounds(loc)?;

        let exp = {
            let page = self.page_mut(page_of(loc))?;
            let (_, typ, _) = read_slot_header(&page.data, off);
            if typ & 0xff != STATE_LIVE {
                return Err(StorageError::SlotNotFound(loc));
            }
            typ >> 8
        };
        let ci = (exp - MIN_CLASS_EXP) as usize;

        let next = self.free_heads[ci];
        let page = self.page_mut(page_of(loc))?;
        write_slot_header(&mut page.data, off, 0, (exp << 8) | STATE_FREE, 0);
        write_u64(&mut page.data, off + SLOT_HEADER_SIZE, next);
        page.dirty = true;

        self.free_heads[ci] = loc;
        self.version += 1;
        Ok(())
    }

    /// Write back all dirty pages and the header, then fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.write_header()?;

        let page_size = self.page_size;
        let mut dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(idx, _)| *idx)
            .collect();
        dirty.sort_unstable();

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Closed("slot file".into()))?;

        for idx in dirty {
            let page = self.cache.get_mut(&idx).expect("dirty page present");
            file.seek(SeekFrom::Start(idx * page_size as u64))?;
            file.write_all(&page.data)?;
            page.dirty = false;
        }

        let want = self.page_count * page_size as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Discard all unflushed changes and reload the header from disk.
    pub fn rollback(&mut self) -> Result<()> {
        self.cache.clear();

        let page_size = self.page_size;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Closed("slot file".into()))?;

        let mut header = vec![0u8; page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let len = file.metadata()?.len();

        self.load_header(&header)?;
        self.page_count = len / page_size as u64;
        Ok(())
    }

    /// Flush and release the underlying file.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.flush()?;
            self.file = None;
        }
        Ok(())
    }

    // === Internals ===

    fn class_exp_for(&self, size: usize) -> Result<u32> {
        let needed = size + SLOT_HEADER_SIZE;
        if needed > self.page_size {
            return Err(StorageError::RecordTooLarge(size, self.max_record_size()));
        }
        let mut exp = MIN_CLASS_EXP;
        while (1usize << exp) < needed {
            exp += 1;
        }
        Ok(exp)
    }

    /// Carve a fresh page into slots of one size class and push them all
    /// onto the class free list.
    fn carve_page(&mut self, exp: u32) -> Result<()> {
        let class = 1usize << exp;
        let ci = (exp - MIN_CLASS_EXP) as usize;
        let page_idx = self.page_count;
        self.page_count += 1;

        let mut data = vec![0u8; self.page_size];
        let nslots = self.page_size / class;
        let mut head = self.free_heads[ci];
        for i in (0..nslots).rev() {
            let off = i * class;
            write_slot_header(&mut data, off, 0, (exp << 8) | STATE_FREE, 0);
            write_u64(&mut data, off + SLOT_HEADER_SIZE, head);
            head = location(page_idx, off as u16);
        }
        self.free_heads[ci] = head;

        self.evict_if_full(page_idx)?;
        self.cache.insert(page_idx, Page { data, dirty: true });
        self.version += 1;
        Ok(())
    }

    fn check_bounds(&self, loc: Location) -> Result<()> {
        let page = page_of(loc);
        let off = offset_of(loc);
        if page == 0
            || page >= self.page_count
            || off + SLOT_HEADER_SIZE > self.page_size
            || loc == NIL
        {
            return Err(StorageError::SlotNotFound(loc));
        }
        Ok(())
    }

    fn page_mut(&mut self, idx: u64) -> Result<&mut Page> {
        if !self.cache.contains_key(&idx) {
            let page_size = self.page_size;
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| StorageError::Closed("slot file".into()))?;
            let mut data = vec![0u8; page_size];
            file.seek(SeekFrom::Start(idx * page_size as u64))?;
            // Pages created since the last flush may not be on disk yet;
            // treat a short read as a zeroed page.
            let mut filled = 0;
            while filled < page_size {
                let n = file.read(&mut data[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            self.evict_if_full(idx)?;
            self.cache.insert(idx, Page { data, dirty: false });
        }
        Ok(self.cache.get_mut(&idx).expect("page just inserted"))
    }

    fn evict_if_full(&mut self, keep: u64) -> Result<()> {
        if self.cache.len() < self.cache_cap {
            return Ok(());
        }
        // Prefer evicting a clean page; otherwise write one back.
        let victim = self
            .cache
            .iter()
            .filter(|(idx, _)| **idx != keep)
            .min_by_key(|(_, p)| p.dirty)
            .map(|(idx, _)| *idx);
        if let Some(idx) = victim {
            let page = self.cache.remove(&idx).expect("victim present");
            if page.dirty {
                let page_size = self.page_size;
                let file = self
                    .file
                    .as_mut()
                    .ok_or_else(|| StorageError::Closed("slot file".into()))?;
                file.seek(SeekFrom::Start(idx * page_size as u64))?;
                file.write_all(&page.data)?;
            }
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; self.page_size];
        write_u32(&mut data, OFF_MAGIC, MAGIC);
        write_u32(&mut data, OFF_FORMAT, FORMAT_VERSION);
        write_u32(&mut data, OFF_PAGE_SIZE, self.page_size as u32);
        write_u64(&mut data, OFF_VERSION, self.version);
        for (i, root) in self.roots.iter().enumerate() {
            write_u64(&mut data, OFF_ROOTS + i * 8, *root);
        }
        for (i, head) in self.free_heads.iter().enumerate() {
            write_u64(&mut data, OFF_FREE_HEADS + i * 8, *head);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Closed("slot file".into()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&data)?;
        Ok(())
    }

    fn load_header(&mut self, data: &[u8]) -> Result<()> {
        if read_u32(data, OFF_MAGIC) != MAGIC {
            return Err(StorageError::InvalidFile(format!(
                "bad magic in {}",
                self.path.display()
            )));
        }
        if read_u32(data, OFF_FORMAT) != FORMAT_VERSION {
            return Err(StorageError::InvalidFile(format!(
                "unsupported format version {}",
                read_u32(data, OFF_FORMAT)
            )));
        }
        if read_u32(data, OFF_PAGE_SIZE) as usize != self.page_size {
            return Err(StorageError::InvalidFile(format!(
                "page size mismatch: file has {}, opened with {}",
                read_u32(data, OFF_PAGE_SIZE),
                self.page_size
            )));
        }
        self.version = read_u64(data, OFF_VERSION);
        for i in 0..NUM_ROOTS {
            self.roots[i] = read_u64(data, OFF_ROOTS + i * 8);
        }
        for i in 0..NUM_CLASSES {
            self.free_heads[i] = read_u64(data, OFF_FREE_HEADS + i * 8);
        }
        Ok(())
    }
}

impl Drop for SlotFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// === Little-endian field helpers ===

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().expect("4 bytes"))
}

fn write_u32(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().expect("8 bytes"))
}

fn write_u64(data: &mut [u8], off: usize, v: u64) {
    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn read_slot_header(data: &[u8], off: usize) -> (u32, u32, u32) {
    (
        read_u32(data, off),
        read_u32(data, off + 4),
        read_u32(data, off + 8),
    )
}

fn write_slot_header(data: &mut [u8], off: usize, len: u32, typ: u32, crc: u32) {
    write_u32(data, off, len);
    write_u32(data, off + 4, typ);
    write_u32(data, off + 8, crc);
    write_u32(data, off + 12, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut sf = SlotFile::open(dir.path().join("test.slots"), 4096).unwrap();

        let loc = sf.allocate(11).unwrap();
        sf.write(loc, b"hello slots").unwrap();
        assert_eq!(sf.read(loc).unwrap(), b"hello slots");
    }

    #[test]
    fn free_slots_are_reused() {
        let dir = tempdir().unwrap();
        let mut sf = SlotFile::open(dir.path().join("test.slots"), 4096).unwrap();

        let loc = sf.allocate(20).unwrap();
        sf.write(loc, b"first").unwrap();
        sf.free(loc).unwrap();
        assert!(matches!(
            sf.read(loc),
            Err(StorageError::SlotNotFound(_))
        ));

        // Same size class comes back from the free list.
        let loc2 = sf.allocate(20).unwrap();
        assert_eq!(loc, loc2);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let dir = tempdir().unwrap();
        let mut sf = SlotFile::open(dir.path().join("test.slots"), 4096).unwrap();

        let loc = sf.allocate(10).unwrap();
        let big = vec![7u8; 100];
        assert!(matches!(
            sf.write(loc, &big),
            Err(StorageError::RecordInUse(_, 100))
        ));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.slots");

        let loc = {
            let mut sf = SlotFile::open(&path, 4096).unwrap();
            let loc = sf.allocate(5).unwrap();
            sf.write(loc, b"perma").unwrap();
            sf.set_root(0, loc).unwrap();
            sf.close().unwrap();
            loc
        };

        let mut sf = SlotFile::open(&path, 4096).unwrap();
        assert_eq!(sf.root(0).unwrap(), loc);
        assert_eq!(sf.read(loc).unwrap(), b"perma");
    }

    #[test]
    fn rollback_reverts_to_last_flush() {
        let dir = tempdir().unwrap();
        let mut sf = SlotFile::open(dir.path().join("test.slots"), 4096).unwrap();

        let loc = sf.allocate(6).unwrap();
        sf.write(loc, b"stable").unwrap();
        sf.flush().unwrap();

        sf.write(loc, b"gone..").unwrap();
        sf.rollback().unwrap();
        assert_eq!(sf.read(loc).unwrap(), b"stable");
    }

    #[test]
    fn too_large_allocation_fails() {
        let dir = tempdir().unwrap();
        let mut sf = SlotFile::open(dir.path().join("test.slots"), 4096).unwrap();
        assert!(matches!(
            sf.allocate(5000),
            Err(StorageError::RecordTooLarge(5000, _))
        ));
    }
}
