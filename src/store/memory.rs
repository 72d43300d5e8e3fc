use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use spv_types::hash::H256;
use spv_types::header::StoredBlock;

use super::{BlockStore, StoreError};

/// Default number of blocks kept before the oldest insertions are
/// evicted. Ample for SPV clients that follow the tip.
pub const DEFAULT_CAPACITY: usize = 5000;

/// An in-memory block store bounded by insertion order: once full, the
/// oldest entry goes first, whatever its height. The chain head is held
/// separately and survives eviction of its map entry.
pub struct MemoryStore {
    inner: RwLock<Option<Inner>>,
}

struct Inner {
    blocks: HashMap<H256, StoredBlock>,
    insertion_order: VecDeque<H256>,
    head: Option<StoredBlock>,
    capacity: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        MemoryStore {
            inner: RwLock::new(Some(Inner {
                blocks: HashMap::new(),
                insertion_order: VecDeque::new(),
                head: None,
                capacity,
            })),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl Inner {
    fn evict_to_capacity(&mut self) {
        while self.blocks.len() > self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            self.blocks.remove(&oldest);
        }
    }
}

impl BlockStore for MemoryStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;
        if inner
            .blocks
            .insert(block.block_hash, block.clone())
            .is_none()
        {
            inner.insertion_order.push_back(block.block_hash);
            inner.evict_to_capacity();
        }
        Ok(())
    }

    fn get(&self, hash: &H256) -> Result<Option<StoredBlock>, StoreError> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(inner.blocks.get(hash).cloned())
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        inner.head.clone().ok_or(StoreError::NotFound)
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;
        inner.head = Some(block.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.write().take();
        Ok(())
    }
}
