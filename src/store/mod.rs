//! Persistent hash-to-stored-block mappings with a single chain-head
//! pointer. The chain engine is the only writer; readers may be many.

pub mod memory;
pub mod spv_file;

use std::io;

use spv_types::hash::H256;
use spv_types::header::StoredBlock;
use thiserror::Error;

pub use memory::MemoryStore;
pub use spv_file::SpvStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("block not found")]
    NotFound,
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("store data is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("every slot is occupied by a live block")]
    StoreFull,
}

/// Keeps block metadata across the duration of our chain sync.
///
/// A store always holds at most one chain head: the tip of the
/// highest-work chain seen so far. `put` alone never moves it; the chain
/// engine flips it explicitly once a heavier tip is fully stored, which
/// is what makes a half-finished write crash-safe.
pub trait BlockStore: Send + Sync {
    /// Saves a stored block, keyed by its block hash. Re-putting the
    /// same hash overwrites in place.
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError>;

    /// Looks a block up by hash. `Ok(None)` simply means we never stored
    /// it (or a bounded store evicted it).
    fn get(&self, hash: &H256) -> Result<Option<StoredBlock>, StoreError>;

    /// The current chain head. Fails with [`StoreError::NotFound`] on a
    /// store that was never seeded.
    fn chain_head(&self) -> Result<StoredBlock, StoreError>;

    /// Atomically repoints the chain head. The block must already be in
    /// the store.
    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StoreError>;

    /// Releases the store's resources. Every later operation fails with
    /// [`StoreError::Closed`]. Closing twice is fine.
    fn close(&self) -> Result<(), StoreError>;
}
