use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::RwLock;
use spv_types::hash::H256;
use spv_types::header::{StoredBlock, COMPACT_V2_LEN};

use super::{BlockStore, StoreError};

const MAGIC: &[u8; 4] = b"SPVB";
const FORMAT_VERSION: u32 = 2;
/// Magic, format version, chain-head hash.
const FILE_HEADER_LEN: usize = 4 + 4 + 32;
const HEAD_OFFSET: usize = 8;

/// Default ring capacity: a bit over a year of blocks.
pub const DEFAULT_CAPACITY: usize = 60_000;

/// A block store backed by a single memory-mapped file.
///
/// The file is a fixed-size ring of compact-v2 records behind a small
/// header. A record's home slot is its hash reduced modulo the capacity;
/// collisions probe linearly and an all-zero record marks a free slot.
/// Writes flush the record before the chain-head pointer is touched, so
/// a crash leaves either the old head or the fully-written new one.
pub struct SpvStore {
    inner: RwLock<Option<Inner>>,
}

struct Inner {
    file: File,
    map: MmapMut,
    capacity: usize,
    /// hash -> slot, rebuilt by scanning the ring on open.
    index: HashMap<H256, usize>,
    head: Option<StoredBlock>,
}

impl SpvStore {
    /// Opens or creates the store at `path`. A fresh file is sized for
    /// `capacity` records up front; an existing file keeps the capacity
    /// it was created with.
    pub fn open(path: &Path, capacity: usize) -> Result<SpvStore, StoreError> {
        assert!(capacity > 0, "capacity must be positive");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len() as usize;

        let inner = if len == 0 {
            Self::create(file, capacity)?
        } else {
            Self::load(file, len)?
        };

        Ok(SpvStore {
            inner: RwLock::new(Some(inner)),
        })
    }

    fn create(file: File, capacity: usize) -> Result<Inner, StoreError> {
        let total = FILE_HEADER_LEN + capacity * COMPACT_V2_LEN;
        file.set_len(total as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[..4].copy_from_slice(MAGIC);
        map[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        map.flush_range(0, FILE_HEADER_LEN)?;

        Ok(Inner {
            file,
            map,
            capacity,
            index: HashMap::new(),
            head: None,
        })
    }

    fn load(file: File, len: usize) -> Result<Inner, StoreError> {
        if len < FILE_HEADER_LEN || (len - FILE_HEADER_LEN) % COMPACT_V2_LEN != 0 {
            return Err(StoreError::Corrupt("file length does not fit the layout"));
        }
        let capacity = (len - FILE_HEADER_LEN) / COMPACT_V2_LEN;
        if capacity == 0 {
            return Err(StoreError::Corrupt("file has no record slots"));
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        if &map[..4] != MAGIC {
            return Err(StoreError::Corrupt("bad magic"));
        }
        if u32::from_le_bytes(map[4..8].try_into().unwrap()) != FORMAT_VERSION {
            return Err(StoreError::Corrupt("unsupported format version"));
        }

        let mut index = HashMap::new();
        for slot in 0..capacity {
            let record = record_at(&map, slot);
            if record.iter().all(|&b| b == 0) {
                continue;
            }
            let block = StoredBlock::decode_compact_v2(record)
                .map_err(|_| StoreError::Corrupt("undecodable record"))?;
            index.insert(block.block_hash, slot);
        }

        let head_hash = H256(map[HEAD_OFFSET..HEAD_OFFSET + 32].try_into().unwrap());
        let head = if head_hash.is_zero() {
            None
        } else {
            let slot = *index
                .get(&head_hash)
                .ok_or(StoreError::Corrupt("chain head points at no record"))?;
            Some(
                StoredBlock::decode_compact_v2(record_at(&map, slot))
                    .map_err(|_| StoreError::Corrupt("undecodable record"))?,
            )
        };

        Ok(Inner {
            file,
            map,
            capacity,
            index,
            head,
        })
    }
}

fn record_offset(slot: usize) -> usize {
    FILE_HEADER_LEN + slot * COMPACT_V2_LEN
}

fn record_at(map: &MmapMut, slot: usize) -> &[u8] {
    &map[record_offset(slot)..record_offset(slot) + COMPACT_V2_LEN]
}

/// The record's home slot: the hash's first eight natural bytes, read
/// little-endian, reduced modulo the ring size.
fn home_slot(hash: &H256, capacity: usize) -> usize {
    let prefix = u64::from_le_bytes(hash.0[..8].try_into().unwrap());
    (prefix % capacity as u64) as usize
}

impl Inner {
    fn write_record(&mut self, slot: usize, record: &[u8]) -> Result<(), StoreError> {
        let offset = record_offset(slot);
        self.map[offset..offset + COMPACT_V2_LEN].copy_from_slice(record);
        self.map.flush_range(offset, COMPACT_V2_LEN)?;
        Ok(())
    }
}

impl BlockStore for SpvStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let record = block
            .encode_compact_v2()
            .ok_or(StoreError::Corrupt("chain work outgrew the record format"))?;

        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;

        if let Some(&slot) = inner.index.get(&block.block_hash) {
            return inner.write_record(slot, &record);
        }

        let base = home_slot(&block.block_hash, inner.capacity);
        for probe in 0..inner.capacity {
            let slot = (base + probe) % inner.capacity;
            if record_at(&inner.map, slot).iter().all(|&b| b == 0) {
                inner.write_record(slot, &record)?;
                inner.index.insert(block.block_hash, slot);
                return Ok(());
            }
        }
        Err(StoreError::StoreFull)
    }

    fn get(&self, hash: &H256) -> Result<Option<StoredBlock>, StoreError> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        let Some(&slot) = inner.index.get(hash) else {
            return Ok(None);
        };
        let block = StoredBlock::decode_compact_v2(record_at(&inner.map, slot))
            .map_err(|_| StoreError::Corrupt("undecodable record"))?;
        Ok(Some(block))
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        inner.head.clone().ok_or(StoreError::NotFound)
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;
        if !inner.index.contains_key(&block.block_hash) {
            return Err(StoreError::NotFound);
        }
        // The record is already durable; the head pointer goes last.
        inner.map[HEAD_OFFSET..HEAD_OFFSET + 32].copy_from_slice(&block.block_hash.0);
        inner.map.flush_range(HEAD_OFFSET, 32)?;
        inner.head = Some(block.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(inner) = self.inner.write().take() {
            inner.map.flush()?;
            inner.file.sync_all()?;
        }
        Ok(())
    }
}
